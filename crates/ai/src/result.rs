use thiserror::Error;

use finadvisor_core::DomainError;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure taxonomy of the AI service bridge.
///
/// Variants carry diagnostic detail for logs. What reaches an external caller
/// is only the [`ErrorKind`] plus a generic message (see the orchestrator).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    /// Caller-supplied request is structurally incomplete. No engine call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No response within the configured window.
    #[error("engine call timed out")]
    Timeout,

    /// The engine process died, or the connection failed or was reset.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The engine answered but signalled failure.
    #[error("engine error{}: {detail}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    EngineError { status: Option<u16>, detail: String },

    /// A reply could not be parsed into the expected shape.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The pending call was cancelled before a reply arrived.
    #[error("engine call cancelled")]
    Cancelled,
}

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Timeout,
    TransportFailure,
    EngineError,
    DecodeError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::EngineError => "engine_error",
            ErrorKind::DecodeError => "decode_error",
        }
    }
}

impl BridgeError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeError(msg.into())
    }

    pub fn engine(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::EngineError {
            status,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Validation(_) => ErrorKind::Validation,
            BridgeError::Timeout => ErrorKind::Timeout,
            // A cancelled call never got its answer from the transport.
            BridgeError::TransportFailure(_) | BridgeError::Cancelled => ErrorKind::TransportFailure,
            BridgeError::EngineError { .. } => ErrorKind::EngineError,
            BridgeError::DecodeError(_) => ErrorKind::DecodeError,
        }
    }
}

impl From<DomainError> for BridgeError {
    fn from(value: DomainError) -> Self {
        BridgeError::Validation(value.to_string())
    }
}
