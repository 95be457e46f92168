//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Only caller-side failures live here (malformed or incomplete input).
/// Transport and engine failures belong to the bridge crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. a non-finite amount).
    #[error("validation failed: {0}")]
    Validation(String),

    /// One or more required fields were absent.
    #[error("missing required field(s): {}", .0.join(", "))]
    MissingField(Vec<String>),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn missing(fields: Vec<String>) -> Self {
        Self::MissingField(fields)
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
