//! Framed codec for coordinator-worker traffic.
//!
//! Pairs LengthDelimitedCodec for framing with serde_json for serialization:
//! TCP gives no message boundaries, so every action message travels as one
//! length-prefixed JSON text payload. Works over any AsyncRead/AsyncWrite.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// A closed set of action messages that can cross the wire.
///
/// Every frame carries an `action` field naming its kind; the codec checks
/// membership before deserializing so an unknown action is a protocol error,
/// never a silent drop.
pub trait ActionMessage: Serialize + DeserializeOwned {
    /// Action names this message set accepts.
    const ACTIONS: &'static [&'static str];

    /// Wire name of this message's action.
    fn action(&self) -> &'static str;
}

/// Errors at the message layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("frame is missing an 'action' field")]
    MissingAction,

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec that frames action messages with a 4-byte length prefix and
/// serializes them as JSON.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ActionMessage> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)?;
                let action = value
                    .get("action")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingAction)?;
                if !T::ACTIONS.contains(&action) {
                    return Err(ProtocolError::UnknownAction(action.to_string()));
                }
                let item = serde_json::from_value(value)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: ActionMessage> Encoder<T> for FrameCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        tracing::trace!(frame_bytes = json.len(), action = item.action(), "encoding frame");
        self.inner.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}
