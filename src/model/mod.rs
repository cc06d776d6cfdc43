//! Core data model types for message parts.

pub mod headers;
