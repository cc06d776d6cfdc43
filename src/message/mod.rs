//! Lazily parsed multipart message.
//!
//! A [`Message`] owns the event source and every part. Parsing only moves
//! forward when someone needs more: a part lookup, a header accessor, or a
//! body reader that ran out of chunks. All of them go through one pump
//! guarded by a mutex, so events are applied in stream order no matter how
//! many readers pull at once.

mod arena;
mod part;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::{StoreConfig, ValidatedConfig};
use crate::error::{MimeError, PartKey, Result};
use crate::parser::event::{EventSource, MimeEvent};
use crate::parser::multipart::MimeParser;

use arena::{PartArena, SlotId};
pub use part::Part;

/// Parser state shared by every handle of one message.
pub(crate) struct Pump {
    source: Option<Box<dyn EventSource>>,
    pub(crate) arena: PartArena,
    parsed: bool,
    closed: bool,
    failure: Option<MimeError>,
    /// Part receiving content, between its headers and its end.
    current: Option<SlotId>,
    next_index: usize,
    spill_enabled: bool,
    events: u64,
}

impl Pump {
    fn new(source: Box<dyn EventSource>) -> Self {
        Self {
            source: Some(source),
            arena: PartArena::default(),
            parsed: false,
            closed: false,
            failure: None,
            current: None,
            next_index: 0,
            spill_enabled: true,
            events: 0,
        }
    }

    /// Apply exactly one event. Returns `false` once no events remain.
    pub(crate) fn advance(&mut self, config: &ValidatedConfig) -> Result<bool> {
        if let Some(failure) = &self.failure {
            return Err(failure.replay());
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(false);
        };

        let outcome = match source.next() {
            Some(Ok(event)) => self.apply(event, config),
            Some(Err(e)) => Err(e),
            None => Err(MimeError::malformed(
                0,
                format!("event stream ended after {} events without END_MESSAGE", self.events),
            )),
        };

        match outcome {
            Ok(()) => Ok(true),
            Err(e) => {
                let replay = e.replay();
                debug!(error = %e, "Parsing failed, message aborted");
                self.source = None;
                self.failure = Some(e);
                Err(replay)
            }
        }
    }

    fn apply(&mut self, event: MimeEvent, config: &ValidatedConfig) -> Result<()> {
        self.events += 1;
        match event {
            MimeEvent::StartMessage | MimeEvent::StartPart => {
                trace!(event = ?event, "Start event");
            }
            MimeEvent::Headers(headers) => {
                let id = self.arena.bind_headers(self.next_index, headers)?;
                debug!(
                    index = self.next_index,
                    content_id = ?self.arena.part(id).content_id,
                    "Part headers received"
                );
                self.current = Some(id);
            }
            MimeEvent::Content(data) => {
                let Some(id) = self.current else {
                    return Err(MimeError::malformed(0, "content outside of a part"));
                };
                let part = self.arena.part_mut(id);
                if part.status.is_closed() {
                    trace!(len = data.len(), "Discarding content of closed part");
                } else {
                    part.chain.append(data, config, &mut self.spill_enabled)?;
                }
            }
            MimeEvent::EndPart => {
                let Some(id) = self.current.take() else {
                    return Err(MimeError::malformed(0, "end of part without headers"));
                };
                self.arena.part_mut(id).received = true;
                trace!(index = self.next_index, "Part fully received");
                self.next_index += 1;
            }
            MimeEvent::EndMessage => {
                self.parsed = true;
                self.source = None;
                self.arena.finish();
                info!(parts = self.next_index, events = self.events, "Message fully parsed");
            }
        }
        Ok(())
    }

    /// Pump until `done` holds for the part or the stream runs out.
    ///
    /// Returns `false` if the stream ran out first.
    pub(crate) fn advance_until(
        &mut self,
        config: &ValidatedConfig,
        slot: SlotId,
        done: impl Fn(&arena::PartData) -> bool,
    ) -> Result<bool> {
        loop {
            if done(self.arena.part(slot)) {
                return Ok(true);
            }
            if !self.advance(config)? {
                return Ok(false);
            }
        }
    }

    /// Fail with the stored parse error, if any.
    pub(crate) fn check_failure(&self) -> Result<()> {
        match &self.failure {
            Some(failure) => Err(failure.replay()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// State shared between a message and its parts.
pub(crate) struct Shared {
    pub(crate) config: ValidatedConfig,
    pub(crate) pump: Mutex<Pump>,
}

/// A multipart message whose parts are parsed on demand.
///
/// Cloning yields another handle to the same message.
#[derive(Clone)]
pub struct Message {
    shared: Arc<Shared>,
}

impl Message {
    /// Read a multipart stream delimited by `boundary`.
    pub fn new<R>(reader: R, boundary: &str, config: StoreConfig) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let config = config.validate()?;
        let parser = MimeParser::new(reader, boundary, config.chunk_size());
        Self::with_source(Box::new(parser), config)
    }

    /// Read a multipart file delimited by `boundary`.
    pub fn open(path: impl AsRef<Path>, boundary: &str, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| MimeError::io(path, e))?;
        debug!(path = %path.display(), boundary, "Opened multipart file");
        Self::new(BufReader::new(file), boundary, config)
    }

    /// Drive the message from an injected event source.
    pub fn from_events<S>(source: S, config: StoreConfig) -> Result<Self>
    where
        S: EventSource + 'static,
    {
        Self::with_source(Box::new(source), config.validate()?)
    }

    fn with_source(source: Box<dyn EventSource>, config: ValidatedConfig) -> Result<Self> {
        let eager = config.parses_eagerly();
        let message = Self {
            shared: Arc::new(Shared {
                config,
                pump: Mutex::new(Pump::new(source)),
            }),
        };
        if eager {
            message.parse_all()?;
        }
        Ok(message)
    }

    /// The validated store policy this message runs with.
    pub fn config(&self) -> &ValidatedConfig {
        &self.shared.config
    }

    /// Apply one parse event. Returns `false` once the stream is exhausted.
    pub fn advance(&self) -> Result<bool> {
        self.shared.pump.lock().advance(&self.shared.config)
    }

    /// Parse the remainder of the stream.
    pub fn parse_all(&self) -> Result<()> {
        let mut pump = self.shared.pump.lock();
        while pump.advance(&self.shared.config)? {}
        Ok(())
    }

    /// `true` once the closing boundary was seen.
    pub fn is_parsed(&self) -> bool {
        self.shared.pump.lock().parsed
    }

    /// All parts in stream order. Parses the whole message.
    pub fn attachments(&self) -> Result<Vec<Part>> {
        let mut pump = self.shared.pump.lock();
        while pump.advance(&self.shared.config)? {}
        Ok(pump
            .arena
            .sequenced()
            .into_iter()
            .map(|slot| Part::new(Arc::clone(&self.shared), slot))
            .collect())
    }

    /// Part at arrival `index`.
    ///
    /// Before the message is fully parsed this returns a handle even if the
    /// part has not been seen yet; it fails with `PartNotFound` only once
    /// parsing is complete and no such part exists.
    pub fn part(&self, index: usize) -> Result<Part> {
        self.get_part(PartKey::Index(index))
    }

    /// Part with the given Content-ID (angle brackets optional).
    pub fn part_by_content_id(&self, content_id: &str) -> Result<Part> {
        self.get_part(PartKey::ContentId(content_id.to_string()))
    }

    /// Part by index or Content-ID.
    pub fn get_part(&self, key: impl Into<PartKey>) -> Result<Part> {
        let key = match key.into() {
            PartKey::ContentId(cid) => PartKey::ContentId(normalize_cid(&cid)),
            index => index,
        };

        let mut pump = self.shared.pump.lock();
        pump.check_failure()?;
        let existing = match &key {
            PartKey::Index(i) => pump.arena.by_index(*i),
            PartKey::ContentId(cid) => pump.arena.by_cid(cid),
        };
        let slot = match (existing, pump.parsed || pump.closed) {
            (Some(slot), _) => slot,
            (None, true) => return Err(MimeError::PartNotFound(key)),
            (None, false) => match &key {
                PartKey::Index(i) => pump.arena.placeholder_for_index(*i),
                PartKey::ContentId(cid) => pump.arena.placeholder_for_cid(cid),
            },
        };
        Ok(Part::new(Arc::clone(&self.shared), slot))
    }

    /// Stop parsing and release the stream. Repeated calls are no-ops.
    ///
    /// Parts already received stay readable; reading a part that was still
    /// incomplete fails.
    pub fn close(&self) {
        let mut pump = self.shared.pump.lock();
        if pump.closed {
            return;
        }
        pump.closed = true;
        pump.source = None;
        debug!(parsed = pump.parsed, "Message closed");
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pump = self.shared.pump.lock();
        f.debug_struct("Message")
            .field("parsed", &pump.parsed)
            .field("closed", &pump.closed)
            .field("parts", &pump.arena.len())
            .finish()
    }
}

fn normalize_cid(cid: &str) -> String {
    let cid = cid.trim();
    let cid = cid.strip_prefix("cid:").unwrap_or(cid);
    cid.strip_prefix('<')
        .and_then(|c| c.strip_suffix('>'))
        .unwrap_or(cid)
        .to_string()
}
