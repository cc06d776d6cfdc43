//! Part body storage: spill files, byte runs, the chunk chain, and body readers.

pub mod backing;
pub mod chunk;
pub mod reader;
pub mod run;
