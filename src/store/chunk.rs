//! Append-only chunk chain holding one part's body.
//!
//! Each [`Chunk`] links forward through a [`OnceLock`], so a successor is
//! published exactly once and readers can walk the chain without taking
//! the pump lock. The run inside a chunk is swapped only when the part
//! spills; readers clone the run under a read lock and always see either
//! the old memory run or the finished file run.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ValidatedConfig;
use crate::error::{MimeError, Result};
use crate::store::backing::BackingFile;
use crate::store::run::ByteRun;

/// One node of a part's body.
pub struct Chunk {
    run: RwLock<ByteRun>,
    next: OnceLock<Arc<Chunk>>,
}

impl Chunk {
    fn new(run: ByteRun) -> Self {
        Self {
            run: RwLock::new(run),
            next: OnceLock::new(),
        }
    }

    /// An empty chunk that starts every chain.
    pub fn sentinel() -> Arc<Self> {
        Arc::new(Self::new(ByteRun::Memory(Bytes::new())))
    }

    /// Snapshot of this chunk's storage.
    pub fn run(&self) -> ByteRun {
        self.run.read().clone()
    }

    /// The successor, if it has been appended yet.
    pub fn next(&self) -> Option<Arc<Chunk>> {
        self.next.get().cloned()
    }

    /// Link a new chunk after this one. Fails if a successor already exists.
    fn append(&self, run: ByteRun) -> Result<Arc<Chunk>> {
        let next = Arc::new(Chunk::new(run));
        self.next
            .set(Arc::clone(&next))
            .map_err(|_| MimeError::illegal_state("chunk already has a successor"))?;
        Ok(next)
    }

    fn replace_run(&self, run: ByteRun) {
        *self.run.write() = run;
    }
}

impl Drop for Chunk {
    // Unlink iteratively so long chains do not overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(chunk) = next {
            match Arc::try_unwrap(chunk) {
                Ok(mut chunk) => next = chunk.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.run.read().len())
            .field("has_next", &self.next.get().is_some())
            .finish()
    }
}

/// Where a part's bytes currently live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Bytes held in memory runs.
    pub memory_bytes: u64,
    /// Bytes held in spill file runs.
    pub file_bytes: u64,
    /// Non-empty chunks in the chain.
    pub chunks: usize,
}

impl StorageStats {
    pub fn total(&self) -> u64 {
        self.memory_bytes + self.file_bytes
    }
}

/// Head and tail of a part's chunks, plus the spill bookkeeping.
#[derive(Debug)]
pub struct ChunkChain {
    head: Arc<Chunk>,
    tail: Arc<Chunk>,
    /// Bytes appended to memory since the part started; reset by a spill.
    in_memory: u64,
    backing: Option<Arc<BackingFile>>,
}

impl Default for ChunkChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkChain {
    pub fn new() -> Self {
        let head = Chunk::sentinel();
        Self {
            tail: Arc::clone(&head),
            head,
            in_memory: 0,
            backing: None,
        }
    }

    /// First chunk readers start from.
    pub fn head(&self) -> Arc<Chunk> {
        Arc::clone(&self.head)
    }

    /// Forget chunks before `chunk` so their memory can be reclaimed.
    pub fn advance_head(&mut self, chunk: Arc<Chunk>) {
        self.head = chunk;
    }

    /// The part's spill file, once it has spilled.
    pub fn backing(&self) -> Option<&Arc<BackingFile>> {
        self.backing.as_ref()
    }

    /// Append one run of body bytes, choosing its storage tier.
    ///
    /// Once the part's memory use would exceed the threshold, every memory
    /// run already in the chain is moved to a new spill file and all later
    /// runs go straight to that file. If the spill file cannot be created,
    /// `spill_enabled` is cleared and the run stays in memory.
    pub fn append(
        &mut self,
        data: Bytes,
        config: &ValidatedConfig,
        spill_enabled: &mut bool,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if let Some(file) = &self.backing {
            let run = ByteRun::write_file(file, &data)?;
            self.tail = self.tail.append(run)?;
            return Ok(());
        }

        let len = data.len() as u64;
        let over = config
            .memory_threshold()
            .is_some_and(|threshold| self.in_memory + len > threshold);

        if over && *spill_enabled {
            match BackingFile::create(config) {
                Ok(file) => {
                    let file = Arc::new(file);
                    self.spill(&file)?;
                    let run = ByteRun::write_file(&file, &data)?;
                    self.tail = self.tail.append(run)?;
                    self.backing = Some(file);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        dir = %config.temp_dir().display(),
                        error = %e,
                        "Cannot create spill file, keeping parts in memory"
                    );
                    *spill_enabled = false;
                }
            }
        }

        self.in_memory += len;
        self.tail = self.tail.append(ByteRun::Memory(data))?;
        Ok(())
    }

    /// Rewrite every memory run into `file`, in chain order.
    fn spill(&mut self, file: &Arc<BackingFile>) -> Result<()> {
        let mut moved: u64 = 0;
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(chunk) = cursor {
            let run = chunk.run();
            if run.is_in_memory() && !run.is_empty() {
                moved += run.len() as u64;
                chunk.replace_run(run.spill(file)?);
            }
            cursor = chunk.next();
        }
        info!(
            path = %file.path().display(),
            moved,
            "Part exceeded memory threshold, spilled to disk"
        );
        self.in_memory = 0;
        Ok(())
    }

    /// Count bytes per storage tier from the current head.
    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats::default();
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(chunk) = cursor {
            let run = chunk.run();
            if !run.is_empty() {
                stats.chunks += 1;
                if run.is_in_memory() {
                    stats.memory_bytes += run.len() as u64;
                } else {
                    stats.file_bytes += run.len() as u64;
                }
            }
            cursor = chunk.next();
        }
        stats
    }

    /// Drop all chunks and delete the spill file.
    pub fn release(&mut self) {
        if let Some(file) = self.backing.take() {
            file.close();
        }
        *self = Self::new();
    }
}
