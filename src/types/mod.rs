#![forbid(unsafe_code)]

//! Shared identifiers, the crate-wide error type, and content checksums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Content hashing for persisted leaf pages.
pub mod checksum;

pub use checksum::content_hash;

/// Number of a persisted leaf page within one tree's page store.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PageNo(pub u32);

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PageNo {
    fn from(value: u32) -> Self {
        PageNo(value)
    }
}

/// Errors raised by the index engine.
#[derive(thiserror::Error, Debug)]
pub enum FolioError {
    /// Underlying storage failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted page, descriptor or state file is corrupt or incompatible.
    #[error("format: {0}")]
    Format(String),
    /// Lookup or removal of an absent key or entity.
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid key specification or index definition.
    #[error("config: {0}")]
    Config(String),
    /// An event could not be applied to an index.
    #[error("apply {event}: {source}")]
    Apply {
        /// Short description of the failed event.
        event: String,
        /// Root cause reported by the index.
        #[source]
        source: Box<FolioError>,
    },
    /// Encoding of in-memory state failed.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Invalid argument supplied by a caller.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The event queue no longer accepts events.
    #[error("queue {0} is closed")]
    Closed(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FolioError>;

impl FolioError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        FolioError::Format(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FolioError::Config(msg.into())
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        FolioError::NotFound(what.into())
    }

    /// Wraps `self` as the cause of a failed event application.
    pub fn into_apply(self, event: impl fmt::Display) -> Self {
        FolioError::Apply {
            event: event.to_string(),
            source: Box::new(self),
        }
    }

    /// Returns true for the not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FolioError::NotFound(_))
    }
}
