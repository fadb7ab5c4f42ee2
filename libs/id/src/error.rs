//! Error types for ID parsing.

use thiserror::Error;

/// Why a string is not a valid identifier.
///
/// Every variant except [`IdError::Empty`] carries the rejected input, so a
/// malformed node name can be logged as-is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// Well-formed, but an identifier of another kind.
    #[error("{input:?} is not a {expected} ID")]
    WrongKind {
        expected: &'static str,
        input: String,
    },

    #[error("{0:?} has no `prefix_` part")]
    MissingSeparator(String),

    #[error("{input:?} has an invalid ULID: {reason}")]
    InvalidUlid { input: String, reason: String },
}

impl IdError {
    /// True when the input names an identifier of a different kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }
}
