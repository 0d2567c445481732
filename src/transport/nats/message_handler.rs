//! Pure envelope translation between broker messages and NATS messages
//!
//! Two paths are kept behaviorally consistent:
//!
//! - **Passthrough** when the codec is the no-op codec: headers map one-to-one
//!   onto NATS headers and the body is sent verbatim.
//! - **Marshalled** for any other codec: the whole message becomes one opaque
//!   payload and no NATS headers are sent.
//!
//! Body-only mode overrides both and carries the body alone.

use crate::codec::{Codec, CodecError, NOOP_CODEC};
use crate::message::Message;
use crate::transport::{WireHeaders, WireMessage};
use bytes::Bytes;

/// Separator used when a wire header carries several values
pub const HEADER_VALUE_SEPARATOR: &str = ",";

/// Check that a header can be framed on the wire without corrupting it.
///
/// Names are visible ASCII without `:`; values may not contain CR or LF.
pub fn validate_header(key: &str, value: &str) -> Result<(), CodecError> {
    let valid_key = !key.is_empty() && key.bytes().all(|b| (33..=126).contains(&b) && b != b':');
    if !valid_key {
        return Err(CodecError::Marshal(
            format!("invalid header name {key:?}").into(),
        ));
    }
    if value.contains(['\r', '\n']) {
        return Err(CodecError::Marshal(
            format!("header {key:?} has a line break in its value").into(),
        ));
    }
    Ok(())
}

/// Pure envelope encode/decode
pub struct MessageHandler;

impl MessageHandler {
    /// Whether the codec selects the header passthrough path
    pub fn is_passthrough(codec: &dyn Codec) -> bool {
        codec.name() == NOOP_CODEC
    }

    /// Encode a broker message for `subject` (pure function)
    pub fn encode(
        codec: &dyn Codec,
        subject: &str,
        message: &Message,
        body_only: bool,
    ) -> Result<WireMessage, CodecError> {
        if body_only {
            return Ok(WireMessage::new(subject, Bytes::copy_from_slice(&message.body)));
        }

        if Self::is_passthrough(codec) {
            let headers = message
                .header
                .iter()
                .map(|(key, value)| {
                    validate_header(key, value)?;
                    Ok((key.clone(), vec![value.clone()]))
                })
                .collect::<Result<WireHeaders, CodecError>>()?;

            return Ok(WireMessage {
                subject: subject.to_string(),
                headers: (!headers.is_empty()).then_some(headers),
                payload: Bytes::copy_from_slice(&message.body),
            });
        }

        let payload = codec.marshal(message)?;
        Ok(WireMessage::new(subject, payload))
    }

    /// Decode a wire message into `target` (pure function).
    ///
    /// On codec failure the raw payload is left in `target.body` so error
    /// hooks and handlers can inspect what actually arrived.
    pub fn decode(
        codec: &dyn Codec,
        wire: &WireMessage,
        body_only: bool,
        target: &mut Message,
    ) -> Result<(), CodecError> {
        if body_only {
            target.body.extend_from_slice(&wire.payload);
            return Ok(());
        }

        if Self::is_passthrough(codec) {
            if let Some(headers) = &wire.headers {
                for (key, values) in headers {
                    target
                        .header
                        .insert(key.clone(), values.join(HEADER_VALUE_SEPARATOR));
                }
            }
            target.body.extend_from_slice(&wire.payload);
            return Ok(());
        }

        match codec.unmarshal(&wire.payload, target) {
            Ok(()) => Ok(()),
            Err(err) => {
                target.body.clear();
                target.body.extend_from_slice(&wire.payload);
                Err(err)
            }
        }
    }
}
