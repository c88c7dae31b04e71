//! Error types for the meshradio engine.
//!
//! Two surfaces: the crate-internal [`Error`] covering every subsystem, and
//! the small [`SendError`] taxonomy that `transmit_*` callers actually see.
//! Recoverable failures (framing, dedup, transport fallback) are handled
//! locally and counted; only errors a caller can act on cross the API.

use thiserror::Error;

use crate::protocol::FrameError;

/// Result type alias for meshradio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-internal error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("no route to destination")]
    NoRoute,

    #[error("peer is not paired")]
    NotPaired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("pairing blob expired")]
    PairingExpired,

    #[error("malformed pairing blob: {0}")]
    DecodePairingBlob(String),

    #[error("queue is full")]
    Backpressure,

    #[error("parked queue is full")]
    ParkedFull,

    #[error("engine is powered off")]
    PoweredOff,

    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("platform service failure: {0}")]
    Platform(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("fatal host service failure: {0}")]
    Fatal(String),
}

impl Error {
    /// Map to the caller-facing taxonomy, if this error is one a
    /// `transmit_*` caller can act on.
    pub fn as_send_error(&self) -> Option<SendError> {
        match self {
            Error::PoweredOff => Some(SendError::PoweredOff),
            Error::NoRoute => Some(SendError::NoRoute),
            Error::NotPaired => Some(SendError::NotPaired),
            Error::PayloadTooLarge(_) => Some(SendError::PayloadTooLarge),
            Error::Backpressure | Error::ParkedFull => Some(SendError::Backpressure),
            _ => None,
        }
    }

    /// True for errors the engine recovers from without surfacing.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Fatal(_))
    }
}

/// Errors surfaced by `transmit_text` / `transmit_voice` /
/// `send_emergency_beacon`. Every variant maps to exactly one failure the
/// caller can act on; nothing hides behind a generic "failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("engine is powered off")]
    PoweredOff,
    #[error("no route to destination")]
    NoRoute,
    #[error("no verified pairing for encrypted send")]
    NotPaired,
    #[error("payload exceeds the configured limit")]
    PayloadTooLarge,
    #[error("engine queues are full")]
    Backpressure,
}

impl From<SendError> for Error {
    fn from(err: SendError) -> Self {
        match err {
            SendError::PoweredOff => Error::PoweredOff,
            SendError::NoRoute => Error::NoRoute,
            SendError::NotPaired => Error::NotPaired,
            SendError::PayloadTooLarge => Error::PayloadTooLarge(0),
            SendError::Backpressure => Error::Backpressure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_mapping() {
        assert_eq!(
            Error::PoweredOff.as_send_error(),
            Some(SendError::PoweredOff)
        );
        assert_eq!(Error::NoRoute.as_send_error(), Some(SendError::NoRoute));
        assert_eq!(
            Error::Backpressure.as_send_error(),
            Some(SendError::Backpressure)
        );
        assert_eq!(
            Error::ParkedFull.as_send_error(),
            Some(SendError::Backpressure)
        );
        assert!(Error::AuthFailed.as_send_error().is_none());
    }

    #[test]
    fn fatal_is_not_recoverable() {
        assert!(!Error::Fatal("clock failure".into()).is_recoverable());
        assert!(Error::NoRoute.is_recoverable());
    }
}
