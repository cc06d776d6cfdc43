//! Centralized error types for mimestore.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// How a caller addressed a part: by arrival index or by Content-ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartKey {
    /// Zero-based position of the part in the stream.
    Index(usize),
    /// Content-ID with angle brackets removed.
    ContentId(String),
}

impl fmt::Display for PartKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartKey::Index(i) => write!(f, "index {i}"),
            PartKey::ContentId(cid) => write!(f, "Content-ID '{cid}'"),
        }
    }
}

impl From<usize> for PartKey {
    fn from(index: usize) -> Self {
        PartKey::Index(index)
    }
}

impl From<&str> for PartKey {
    fn from(cid: &str) -> Self {
        PartKey::ContentId(cid.to_string())
    }
}

impl From<String> for PartKey {
    fn from(cid: String) -> Self {
        PartKey::ContentId(cid)
    }
}

/// All errors produced by the mimestore library.
#[derive(Error, Debug)]
pub enum MimeError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The multipart stream violates the boundary or header grammar.
    #[error("Malformed multipart stream at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    /// A second header block arrived for a part that already has one.
    #[error("Part {index} already has headers; conflicting block with Content-ID '{content_id}'")]
    Conflict { index: usize, content_id: String },

    /// The message is fully parsed and the requested part does not exist.
    #[error("No part with {0}")]
    PartNotFound(PartKey),

    /// An operation was attempted on a closed or exhausted object.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias for `Result<T, MimeError>`.
pub type Result<T> = std::result::Result<T, MimeError>;

impl MimeError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Recover the error a body reader surfaced through `std::io::Read`.
    ///
    /// Failures raised by the store come back as themselves; plain I/O
    /// errors become `Io`.
    pub fn from_body_read(e: std::io::Error) -> Self {
        match e.get_ref().and_then(|inner| inner.downcast_ref::<MimeError>()) {
            Some(inner) => inner.replay(),
            None => Self::io("<part body>", e),
        }
    }

    /// Create a `Malformed` variant at a stream offset.
    pub fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an `IllegalState` variant.
    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState(reason.into())
    }

    /// Rebuild an equivalent error so a stored failure can be reported again.
    ///
    /// `std::io::Error` is not `Clone`, so the I/O variant keeps the kind and
    /// the rendered message of the original.
    pub fn replay(&self) -> Self {
        match self {
            Self::Io { path, source } => Self::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Self::Malformed { offset, reason } => Self::Malformed {
                offset: *offset,
                reason: reason.clone(),
            },
            Self::Conflict { index, content_id } => Self::Conflict {
                index: *index,
                content_id: content_id.clone(),
            },
            Self::PartNotFound(key) => Self::PartNotFound(key.clone()),
            Self::IllegalState(reason) => Self::IllegalState(reason.clone()),
            Self::Config(reason) => Self::Config(reason.clone()),
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `MimeError::io`).
impl From<std::io::Error> for MimeError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

/// Body readers surface failures through `std::io::Read`.
impl From<MimeError> for std::io::Error {
    fn from(e: MimeError) -> Self {
        use std::io::ErrorKind;
        match e {
            MimeError::Io { source, .. } => source,
            MimeError::Malformed { .. } => std::io::Error::new(ErrorKind::InvalidData, e),
            MimeError::PartNotFound(_) => std::io::Error::new(ErrorKind::NotFound, e),
            MimeError::Config(_) => std::io::Error::new(ErrorKind::InvalidInput, e),
            MimeError::Conflict { .. } | MimeError::IllegalState(_) => {
                std::io::Error::new(ErrorKind::Other, e)
            }
        }
    }
}
