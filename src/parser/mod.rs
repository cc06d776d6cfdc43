//! Multipart tokenizing: parse events, the default boundary tokenizer, and header decoding.

pub mod event;
pub mod header;
pub mod multipart;
