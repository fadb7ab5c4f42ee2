//! Error types for coordination store operations.

use thiserror::Error;

use crate::Version;

/// Result type alias for coordination store operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors returned by a [`Connection`](crate::Connection).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    /// The node changed since it was read.
    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: Version,
        actual: Version,
    },

    /// A typed node was written without ever having been read.
    #[error("node {0} has no version; read it before writing")]
    Unversioned(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection closed")]
    Closed,
}

impl CoordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
