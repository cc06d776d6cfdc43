//! Parse events exchanged between a tokenizer and a [`Message`](crate::message::Message).

use bytes::Bytes;

use crate::error::Result;
use crate::model::headers::Headers;

/// One step of a multipart stream, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeEvent {
    StartMessage,
    StartPart,
    /// Header block of the part just started.
    Headers(Headers),
    /// A run of body bytes for the current part.
    Content(Bytes),
    EndPart,
    EndMessage,
}

/// A pull-driven source of [`MimeEvent`]s.
///
/// Any iterator of event results qualifies; the message pulls one event
/// per pump step and stops at `None`.
pub trait EventSource: Iterator<Item = Result<MimeEvent>> + Send {}

impl<T> EventSource for T where T: Iterator<Item = Result<MimeEvent>> + Send {}
