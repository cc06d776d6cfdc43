//! `mimestore`: a lazily parsed, streaming multipart store.
//!
//! A [`Message`] reads a multipart body only as far as its callers need.
//! Each [`Part`] exposes its headers and a re-readable body; bodies that
//! outgrow the configured memory threshold are spilled to a temp file.

pub mod config;
pub mod error;
pub mod export;
pub mod message;
pub mod model;
pub mod parser;
pub mod store;

pub use config::{StoreConfig, ValidatedConfig};
pub use error::{MimeError, PartKey, Result};
pub use message::{Message, Part};
pub use model::headers::Headers;
pub use parser::event::{EventSource, MimeEvent};
pub use store::chunk::StorageStats;
pub use store::reader::BodyReader;
