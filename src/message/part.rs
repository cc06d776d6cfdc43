//! Handle to one part of a [`Message`](super::Message).

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tracing::{debug, info};

use super::arena::{PartStatus, SlotId};
use super::{Pump, Shared};
use crate::error::{MimeError, PartKey, Result};
use crate::model::headers::Headers;
use crate::store::chunk::{Chunk, StorageStats};
use crate::store::reader::{BodyReader, ChunkFeed};

/// One attachment of a message.
///
/// Headers and body are filled in as the message is parsed. Accessors
/// pull the parse forward as far as they need to; nothing runs in the
/// background. Handles are cheap to clone and compare equal when they
/// refer to the same logical part.
#[derive(Clone)]
pub struct Part {
    shared: Arc<Shared>,
    slot: SlotId,
}

impl Part {
    pub(crate) fn new(shared: Arc<Shared>, slot: SlotId) -> Self {
        Self { shared, slot }
    }

    /// Content-ID without angle brackets, or the arrival index as a string
    /// when the part has none.
    pub fn content_id(&self) -> Result<String> {
        self.with_headers(|pump, slot| {
            Ok(pump.arena.part(slot).content_id.clone().unwrap_or_default())
        })
    }

    /// Declared content type, `application/octet-stream` if absent.
    pub fn content_type(&self) -> Result<String> {
        self.with_headers(|pump, slot| Ok(headers_of(pump, slot)?.content_type().to_string()))
    }

    /// All values of header `name`, in order of appearance.
    pub fn header(&self, name: &str) -> Result<Vec<String>> {
        self.with_headers(|pump, slot| {
            Ok(headers_of(pump, slot)?
                .get(name)
                .into_iter()
                .map(str::to_string)
                .collect())
        })
    }

    /// A copy of the full header block.
    pub fn headers(&self) -> Result<Headers> {
        self.with_headers(|pump, slot| Ok(headers_of(pump, slot)?.clone()))
    }

    /// Zero-based arrival position in the stream.
    pub fn index(&self) -> Result<usize> {
        self.with_headers(|pump, slot| {
            pump.arena
                .part(slot)
                .index
                .ok_or_else(|| MimeError::illegal_state("part has headers but no index"))
        })
    }

    /// `true` once the part's closing boundary was seen. Does not parse.
    pub fn is_received(&self) -> bool {
        self.shared.pump.lock().arena.part(self.slot).received
    }

    /// Where the bytes received so far are stored. Does not parse.
    pub fn storage(&self) -> StorageStats {
        self.shared.pump.lock().arena.part(self.slot).chain.stats()
    }

    /// Open a reader over the body. Every call starts from the first byte.
    pub fn read(&self) -> Result<BodyReader> {
        let mut pump = self.shared.pump.lock();
        let part = ensure_readable(&mut pump, self.slot)?;
        part.opened = true;
        Ok(self.reader(false))
    }

    /// Open a single-pass reader over the body.
    ///
    /// Chunks are dropped as soon as the reader moves past them, unless a
    /// repeatable reader was opened earlier. Later calls to `read`,
    /// `read_once` or `move_to` fail.
    pub fn read_once(&self) -> Result<BodyReader> {
        let mut pump = self.shared.pump.lock();
        let part = ensure_readable(&mut pump, self.slot)?;
        part.read_once = true;
        let discard = !part.opened;
        Ok(self.reader(discard))
    }

    fn reader(&self, discard: bool) -> BodyReader {
        BodyReader::new(Box::new(PartFeed {
            shared: Arc::clone(&self.shared),
            slot: self.slot,
            discard,
            status: OnceLock::new(),
        }))
    }

    /// Read the whole body into one buffer.
    pub fn bytes(&self) -> Result<Bytes> {
        let mut reader = self.read()?;
        let mut buf = Vec::new();
        std::io::copy(&mut reader, &mut buf).map_err(MimeError::from_body_read)?;
        Ok(Bytes::from(buf))
    }

    /// Write the body to `dest` and close the part.
    ///
    /// A part that spilled has its spill file renamed into place; otherwise
    /// the chunks are written out.
    pub fn move_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let mut pump = self.shared.pump.lock();
        ensure_readable(&mut pump, self.slot)?;
        let config = &self.shared.config;
        if !pump.advance_until(config, self.slot, |p| p.received)? {
            return Err(MimeError::illegal_state(
                "message closed before the part was fully received",
            ));
        }

        let part = pump.arena.part_mut(self.slot);
        match part.chain.backing() {
            Some(file) => {
                file.persist(dest)?;
                info!(dest = %dest.display(), bytes = part.chain.stats().total(), "Moved spilled part");
            }
            None => {
                let mut out = File::create(dest).map_err(|e| MimeError::io(dest, e))?;
                let mut cursor = Some(part.chain.head());
                while let Some(chunk) = cursor {
                    out.write_all(&chunk.run().to_bytes()?)
                        .map_err(|e| MimeError::io(dest, e))?;
                    cursor = chunk.next();
                }
                out.flush().map_err(|e| MimeError::io(dest, e))?;
                debug!(dest = %dest.display(), "Wrote in-memory part");
            }
        }
        part.status.close();
        part.chain.release();
        Ok(())
    }

    /// Release the part's storage. Open readers fail on their next read.
    /// Repeated calls are no-ops.
    pub fn close(&self) {
        let mut pump = self.shared.pump.lock();
        let part = pump.arena.part_mut(self.slot);
        if part.status.close() {
            part.chain.release();
            debug!(index = ?part.index, content_id = ?part.content_id, "Part closed");
        }
    }

    /// Run `f` once the part's headers are attached, parsing as needed.
    fn with_headers<T>(&self, f: impl FnOnce(&Pump, SlotId) -> Result<T>) -> Result<T> {
        let mut pump = self.shared.pump.lock();
        await_headers(&mut pump, &self.shared, self.slot)?;
        f(&*pump, self.slot)
    }

    fn resolved(&self) -> SlotId {
        self.shared.pump.lock().arena.resolve(self.slot)
    }
}

impl PartialEq for Part {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared) && self.resolved() == other.resolved()
    }
}

impl Eq for Part {}

impl std::fmt::Debug for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pump = self.shared.pump.lock();
        let part = pump.arena.part(self.slot);
        f.debug_struct("Part")
            .field("index", &part.index)
            .field("content_id", &part.content_id)
            .field("received", &part.received)
            .field("closed", &part.status.is_closed())
            .finish()
    }
}

fn headers_of(pump: &Pump, slot: SlotId) -> Result<&Headers> {
    pump.arena
        .part(slot)
        .headers
        .as_ref()
        .ok_or_else(|| MimeError::illegal_state("part headers missing"))
}

fn key_of(pump: &Pump, slot: SlotId) -> PartKey {
    let part = pump.arena.part(slot);
    match (&part.index, &part.content_id) {
        (Some(index), _) => PartKey::Index(*index),
        (None, Some(cid)) => PartKey::ContentId(cid.clone()),
        (None, None) => PartKey::Index(slot),
    }
}

/// Parse until the part's headers arrive.
///
/// Once headers are attached the part's slot can no longer be merged, so
/// callers may cache anything they read from it afterwards.
fn await_headers(pump: &mut Pump, shared: &Shared, slot: SlotId) -> Result<()> {
    if pump.advance_until(&shared.config, slot, |p| p.headers.is_some())? {
        return Ok(());
    }
    let key = key_of(pump, slot);
    if pump.is_closed() {
        Err(MimeError::illegal_state(format!(
            "message closed before headers of part {key} arrived"
        )))
    } else {
        Err(MimeError::illegal_state(format!(
            "message ended without headers for part {key}"
        )))
    }
}

fn ensure_readable(pump: &mut Pump, slot: SlotId) -> Result<&mut super::arena::PartData> {
    pump.check_failure()?;
    let part = pump.arena.part_mut(slot);
    if part.status.is_closed() {
        return Err(MimeError::illegal_state("part is closed"));
    }
    if part.read_once {
        return Err(MimeError::illegal_state("part was already consumed by read_once"));
    }
    Ok(part)
}

/// Chunk feed that drives the shared pump for one part.
struct PartFeed {
    shared: Arc<Shared>,
    slot: SlotId,
    /// Drop chunks behind the reader.
    discard: bool,
    /// Close flag of the resolved part, cached once headers are known.
    status: OnceLock<Arc<PartStatus>>,
}

impl ChunkFeed for PartFeed {
    fn start(&self) -> Result<Arc<Chunk>> {
        let mut pump = self.shared.pump.lock();
        pump.check_failure()?;
        await_headers(&mut pump, &self.shared, self.slot)?;
        let part = pump.arena.part(self.slot);
        if part.status.is_closed() {
            return Err(MimeError::illegal_state("part is closed"));
        }
        let _ = self.status.set(Arc::clone(&part.status));
        Ok(part.chain.head())
    }

    fn fetch(&self, current: &Arc<Chunk>) -> Result<Option<Arc<Chunk>>> {
        let mut pump = self.shared.pump.lock();
        loop {
            pump.check_failure()?;
            let part = pump.arena.part_mut(self.slot);
            if part.status.is_closed() {
                return Err(MimeError::illegal_state("part is closed"));
            }
            if let Some(next) = current.next() {
                if self.discard {
                    part.chain.advance_head(Arc::clone(&next));
                }
                return Ok(Some(next));
            }
            if part.received {
                return Ok(None);
            }
            if !pump.advance(&self.shared.config)? {
                return Err(MimeError::illegal_state(
                    "message closed before the part was fully received",
                ));
            }
        }
    }

    fn is_closed(&self) -> bool {
        match self.status.get() {
            Some(status) => status.is_closed(),
            None => self.shared.pump.lock().arena.part(self.slot).status.is_closed(),
        }
    }
}
