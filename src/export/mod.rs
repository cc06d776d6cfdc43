//! Export functionality: write parts of a message to disk.

pub mod attachment;
