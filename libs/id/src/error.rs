//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The UUID portion is invalid.
    #[error("invalid domain UUID: {0}")]
    InvalidUuid(String),

    /// The host identifier is not a valid hostname.
    #[error("invalid host identifier '{value}': {reason}")]
    InvalidHost { value: String, reason: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
