//! Pluggable message codecs
//!
//! A codec turns a whole [`Message`] into one opaque payload and back. The
//! codec whose [`Codec::name`] is [`NOOP_CODEC`] is special-cased by the NATS
//! envelope bridge: headers are mapped onto native NATS headers and the body is
//! sent verbatim instead of being marshalled.

use crate::message::Message;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of the header-passthrough codec
pub const NOOP_CODEC: &str = "noop";

/// Identifier of the JSON codec
pub const JSON_CODEC: &str = "json";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Marshal failed: {0}")]
    Marshal(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unmarshal failed: {0}")]
    Unmarshal(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Message has no topic header")]
    MissingTopic,
}

pub trait Codec: Send + Sync + fmt::Debug {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<(), CodecError>;

    /// Codec identifier
    fn name(&self) -> &str;
}

/// Body passthrough codec
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCodec;

impl Codec for NoopCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        Ok(message.body.clone())
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<(), CodecError> {
        message.body.clear();
        message.body.extend_from_slice(data);
        Ok(())
    }

    fn name(&self) -> &str {
        NOOP_CODEC
    }
}

/// Marshals the full message (headers and body) as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Marshal(Box::new(e)))
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<(), CodecError> {
        *message = serde_json::from_slice(data).map_err(|e| CodecError::Unmarshal(Box::new(e)))?;
        Ok(())
    }

    fn name(&self) -> &str {
        JSON_CODEC
    }
}

/// Look up a bundled codec by identifier
pub fn codec_by_name(name: &str) -> Option<Arc<dyn Codec>> {
    match name.to_lowercase().as_str() {
        NOOP_CODEC => Some(Arc::new(NoopCodec)),
        JSON_CODEC => Some(Arc::new(JsonCodec)),
        _ => None,
    }
}
