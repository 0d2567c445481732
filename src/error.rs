//! Error types for broker operations
//!
//! Every fallible broker call returns [`BrokerError`]. Transport, codec and
//! configuration failures are wrapped without losing their source so callers
//! can still match on the underlying kind.

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::transport::TransportError;
use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("codec is nil")]
    MissingCodec,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Drain did not complete within {0:?}")]
    DrainTimeout(std::time::Duration),

    #[error("Drain interrupted: {0}")]
    DrainInterrupted(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BrokerError {
    /// Whether the error reports that no usable connection exists
    pub fn is_not_connected(&self) -> bool {
        matches!(self, BrokerError::NotConnected)
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
