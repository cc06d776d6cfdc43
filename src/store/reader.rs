//! Pull-driven body reader over a chunk chain.
//!
//! The reader never waits on another thread. When it runs out of chunks
//! it asks its [`ChunkFeed`] for the next one, and the feed pulls the
//! parser forward until that chunk exists or the part is complete.

use std::io::Read;
use std::sync::Arc;

use tracing::trace;

use crate::error::{MimeError, Result};
use crate::store::chunk::Chunk;
use crate::store::run::ByteRun;

/// Supplies chunks to a [`BodyReader`], driving the parse as needed.
pub trait ChunkFeed: Send + Sync {
    /// The chunk reading starts from (an empty sentinel or a consumed chunk).
    fn start(&self) -> Result<Arc<Chunk>>;

    /// The chunk after `current`, or `None` once the body is complete.
    fn fetch(&self, current: &Arc<Chunk>) -> Result<Option<Arc<Chunk>>>;

    /// `true` if the owning part was closed.
    fn is_closed(&self) -> bool;
}

enum Position {
    Unstarted,
    At {
        chunk: Arc<Chunk>,
        run: ByteRun,
        offset: usize,
    },
    Finished,
    Closed,
}

/// Sequential reader over one part's body.
pub struct BodyReader {
    feed: Box<dyn ChunkFeed>,
    position: Position,
}

impl BodyReader {
    pub fn new(feed: Box<dyn ChunkFeed>) -> Self {
        Self {
            feed,
            position: Position::Unstarted,
        }
    }

    /// Drop the chunk reference. Later reads fail.
    pub fn close(&mut self) {
        self.position = Position::Closed;
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if matches!(self.position, Position::Closed) {
            return Err(MimeError::illegal_state("body reader is closed"));
        }
        if self.feed.is_closed() {
            return Err(MimeError::illegal_state("part is closed"));
        }

        loop {
            let next = match &mut self.position {
                Position::Closed => return Err(MimeError::illegal_state("body reader is closed")),
                Position::Finished => return Ok(0),
                Position::Unstarted => Some(self.feed.start()?),
                Position::At { chunk, run, offset } => {
                    if *offset < run.len() {
                        let n = run.read_at(*offset, buf)?;
                        *offset += n;
                        return Ok(n);
                    }
                    self.feed.fetch(chunk)?
                }
            };

            self.position = match next {
                Some(chunk) => {
                    let run = chunk.run();
                    trace!(len = run.len(), memory = run.is_in_memory(), "Reader moved to next chunk");
                    Position::At {
                        chunk,
                        run,
                        offset: 0,
                    }
                }
                None => Position::Finished,
            };
        }
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_body(buf).map_err(Into::into)
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.position {
            Position::Unstarted => "unstarted",
            Position::At { .. } => "reading",
            Position::Finished => "finished",
            Position::Closed => "closed",
        };
        f.debug_struct("BodyReader").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::chunk::ChunkChain;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Feed over a chain that is already complete.
    struct FixedFeed {
        head: Arc<Chunk>,
        closed: AtomicBool,
    }

    impl ChunkFeed for FixedFeed {
        fn start(&self) -> Result<Arc<Chunk>> {
            Ok(Arc::clone(&self.head))
        }

        fn fetch(&self, current: &Arc<Chunk>) -> Result<Option<Arc<Chunk>>> {
            Ok(current.next())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    fn chain_of(pieces: &[&[u8]]) -> ChunkChain {
        let cfg = StoreConfig::new().memory_only().validate().unwrap();
        let mut chain = ChunkChain::new();
        let mut spill = true;
        for p in pieces {
            chain
                .append(Bytes::copy_from_slice(p), &cfg, &mut spill)
                .unwrap();
        }
        chain
    }

    #[test]
    fn test_reads_across_chunks() {
        let chain = chain_of(&[b"hello ", b"chunked ", b"world"]);
        let mut reader = BodyReader::new(Box::new(FixedFeed {
            head: chain.head(),
            closed: AtomicBool::new(false),
        }));
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello chunked world");
        // End of stream is sticky.
        assert_eq!(reader.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_small_buffer_reads() {
        let chain = chain_of(&[b"abc", b"de"]);
        let mut reader = BodyReader::new(Box::new(FixedFeed {
            head: chain.head(),
            closed: AtomicBool::new(false),
        }));
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"c");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"de");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_closed_reader_fails() {
        let chain = chain_of(&[b"abc"]);
        let mut reader = BodyReader::new(Box::new(FixedFeed {
            head: chain.head(),
            closed: AtomicBool::new(false),
        }));
        reader.close();
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_closed_part_fails_mid_body() {
        let chain = chain_of(&[b"abcdef"]);
        let feed = Arc::new(AtomicBool::new(false));
        struct SharedFlag(Arc<Chunk>, Arc<AtomicBool>);
        impl ChunkFeed for SharedFlag {
            fn start(&self) -> Result<Arc<Chunk>> {
                Ok(Arc::clone(&self.0))
            }
            fn fetch(&self, current: &Arc<Chunk>) -> Result<Option<Arc<Chunk>>> {
                Ok(current.next())
            }
            fn is_closed(&self) -> bool {
                self.1.load(Ordering::Acquire)
            }
        }
        let mut reader = BodyReader::new(Box::new(SharedFlag(chain.head(), Arc::clone(&feed))));
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        feed.store(true, Ordering::Release);
        assert!(reader.read(&mut buf).is_err());
    }
}
