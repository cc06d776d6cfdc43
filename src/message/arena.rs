//! Part arena: every part of a message lives in one slot vector.
//!
//! Arrival index and Content-ID are secondary lookups into the arena.
//! A caller may ask for a part by index and by Content-ID before the
//! stream reaches it; both requests create placeholders, and when the
//! headers reveal they are the same part the Content-ID placeholder is
//! turned into an alias of the index slot. Handles keep working because
//! they always resolve through the arena.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MimeError, Result};
use crate::model::headers::Headers;
use crate::store::chunk::ChunkChain;

/// Stable handle of an arena slot.
pub(crate) type SlotId = usize;

/// Close flag shared between a part and its readers.
#[derive(Debug, Default)]
pub(crate) struct PartStatus {
    closed: AtomicBool,
}

impl PartStatus {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if this call closed the part.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Everything the message knows about one part.
#[derive(Debug, Default)]
pub(crate) struct PartData {
    pub(crate) index: Option<usize>,
    pub(crate) content_id: Option<String>,
    pub(crate) headers: Option<Headers>,
    pub(crate) chain: ChunkChain,
    pub(crate) received: bool,
    pub(crate) read_once: bool,
    /// A repeatable reader was handed out, so chunks must be kept.
    pub(crate) opened: bool,
    pub(crate) status: Arc<PartStatus>,
}

#[derive(Debug)]
enum Slot {
    Part(PartData),
    Alias(SlotId),
}

#[derive(Debug, Default)]
pub(crate) struct PartArena {
    slots: Vec<Slot>,
    by_index: Vec<Option<SlotId>>,
    by_cid: HashMap<String, SlotId>,
}

impl PartArena {
    /// Follow aliases to the slot that holds the part.
    pub(crate) fn resolve(&self, mut id: SlotId) -> SlotId {
        while let Slot::Alias(target) = self.slots[id] {
            id = target;
        }
        id
    }

    pub(crate) fn part(&self, id: SlotId) -> &PartData {
        match &self.slots[self.resolve(id)] {
            Slot::Part(part) => part,
            Slot::Alias(_) => unreachable!("resolve always ends on a part slot"),
        }
    }

    pub(crate) fn part_mut(&mut self, id: SlotId) -> &mut PartData {
        let id = self.resolve(id);
        match &mut self.slots[id] {
            Slot::Part(part) => part,
            Slot::Alias(_) => unreachable!("resolve always ends on a part slot"),
        }
    }

    fn insert(&mut self, part: PartData) -> SlotId {
        self.slots.push(Slot::Part(part));
        self.slots.len() - 1
    }

    /// Slot registered for arrival index `index`.
    pub(crate) fn by_index(&self, index: usize) -> Option<SlotId> {
        self.by_index.get(index).copied().flatten()
    }

    /// Slot registered for `cid`.
    pub(crate) fn by_cid(&self, cid: &str) -> Option<SlotId> {
        self.by_cid.get(cid).copied()
    }

    /// Slot for `index`, creating an empty placeholder if needed.
    pub(crate) fn placeholder_for_index(&mut self, index: usize) -> SlotId {
        if let Some(id) = self.by_index(index) {
            return id;
        }
        let id = self.insert(PartData {
            index: Some(index),
            ..PartData::default()
        });
        if self.by_index.len() <= index {
            self.by_index.resize(index + 1, None);
        }
        self.by_index[index] = Some(id);
        debug!(index, "Created placeholder part");
        id
    }

    /// Slot for `cid`, creating an empty placeholder if needed.
    pub(crate) fn placeholder_for_cid(&mut self, cid: &str) -> SlotId {
        if let Some(id) = self.by_cid(cid) {
            return id;
        }
        let id = self.insert(PartData {
            content_id: Some(cid.to_string()),
            ..PartData::default()
        });
        self.by_cid.insert(cid.to_string(), id);
        debug!(content_id = cid, "Created placeholder part");
        id
    }

    /// Attach the headers of the part at `index`, reconciling both lookups.
    ///
    /// A part without a `Content-ID` header is registered under its index
    /// as a string. An id already owned by a part at another index stays
    /// with that part; the newcomer is reachable by index only.
    pub(crate) fn bind_headers(&mut self, index: usize, headers: Headers) -> Result<SlotId> {
        let declared = headers.content_id().is_some();
        let cid = headers.content_id().unwrap_or_else(|| index.to_string());
        let listed = self.by_index(index);

        if let Some(l) = listed {
            if self.part(l).headers.is_some() {
                warn!(index, content_id = %cid, "Second header block for one part");
                return Err(MimeError::Conflict {
                    index,
                    content_id: cid,
                });
            }
        }

        let mut mapped = self.by_cid(&cid);
        if let Some(owner) = mapped.and_then(|m| self.part(m).index.filter(|&i| i != index)) {
            if declared {
                warn!(index, owner, content_id = %cid, "Duplicate Content-ID, keeping the first part");
            } else {
                debug!(index, owner, content_id = %cid, "Index id already taken, part reachable by index only");
            }
            mapped = None;
        }
        let claim = mapped.is_some() || self.by_cid(&cid).is_none();

        let id = match (listed, mapped) {
            (None, None) => self.insert(PartData::default()),
            (None, Some(m)) => m,
            (Some(l), None) => l,
            (Some(l), Some(m)) => {
                let (l, m) = (self.resolve(l), self.resolve(m));
                if l != m {
                    self.merge(m, l);
                }
                l
            }
        };
        if claim {
            self.by_cid.insert(cid.clone(), id);
        }

        if self.by_index.len() <= index {
            self.by_index.resize(index + 1, None);
        }
        self.by_index[index] = Some(id);

        let part = self.part_mut(id);
        part.index = Some(index);
        part.content_id = Some(cid);
        part.headers = Some(headers);
        Ok(id)
    }

    /// Turn placeholder `from` into an alias of `into`.
    fn merge(&mut self, from: SlotId, into: SlotId) {
        let old = std::mem::replace(&mut self.slots[from], Slot::Alias(into));
        if let Slot::Part(old) = old {
            if old.status.is_closed() {
                self.part(into).status.close();
            }
            let target = self.part_mut(into);
            target.read_once |= old.read_once;
            target.opened |= old.opened;
            debug!(from, into, "Merged placeholder parts");
        }
    }

    /// Parts in arrival order that actually appeared in the stream.
    pub(crate) fn sequenced(&self) -> Vec<SlotId> {
        self.by_index
            .iter()
            .flatten()
            .copied()
            .filter(|&id| self.part(id).headers.is_some())
            .collect()
    }

    /// Drop placeholders that the finished stream never filled.
    pub(crate) fn finish(&mut self) {
        let slots = &self.slots;
        let has_headers = |id: SlotId| {
            let mut id = id;
            while let Slot::Alias(target) = slots[id] {
                id = target;
            }
            matches!(&slots[id], Slot::Part(p) if p.headers.is_some())
        };
        for entry in self.by_index.iter_mut() {
            if entry.is_some_and(|id| !has_headers(id)) {
                *entry = None;
            }
        }
        while matches!(self.by_index.last(), Some(None)) {
            self.by_index.pop();
        }
        self.by_cid.retain(|_, id| has_headers(*id));
    }

    /// Number of parts that appeared in the stream.
    pub(crate) fn len(&self) -> usize {
        self.sequenced().len()
    }
}
