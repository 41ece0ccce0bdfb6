//! Envelope wire codec.
//!
//! An envelope encodes to a JSON header plus one raw part per blob:
//!
//! ```text
//! payload: {"data": {...}, "blobs": [name | null, ...]}
//! parts:   [blob 0 bytes] [blob 1 bytes] ...
//! ```
//!
//! Drivers frame the payload and parts however their transport needs; the
//! blob bytes are never re-encoded.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Blob, Envelope, EnvelopeError, Value};

/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Envelope header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope declares {declared} blob(s) but carries {actual}")]
    PartCountMismatch { declared: usize, actual: usize },

    #[error(transparent)]
    Value(#[from] EnvelopeError),
}

/// An envelope in transport-neutral encoded form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedMessage {
    /// JSON header with the value mapping and blob names.
    pub payload: Bytes,
    /// Raw blob parts, in envelope order.
    pub parts: Vec<Bytes>,
}

impl EncodedMessage {
    /// Total number of bytes carried.
    pub fn len(&self) -> usize {
        self.payload.len() + self.parts.iter().map(Bytes::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct HeaderRef<'a> {
    data: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blobs: Vec<Option<&'a str>>,
}

#[derive(Deserialize)]
struct Header {
    data: serde_json::Value,
    #[serde(default)]
    blobs: Vec<Option<String>>,
}

/// Encode an envelope. Fails only if the envelope holds a value outside the
/// value union (a non-finite number inserted through `Value::Number`).
pub fn encode(envelope: &Envelope) -> Result<EncodedMessage, CodecError> {
    for (key, value) in envelope.data() {
        value.validate(key)?;
    }

    let header = HeaderRef {
        data: envelope.data(),
        blobs: envelope.blobs().iter().map(Blob::name).collect(),
    };
    let payload = serde_json::to_vec(&header)?;

    Ok(EncodedMessage {
        payload: Bytes::from(payload),
        parts: envelope.blobs().iter().map(|b| b.data().clone()).collect(),
    })
}

/// Decode an envelope produced by [`encode`].
pub fn decode(message: EncodedMessage) -> Result<Envelope, CodecError> {
    let header: Header = serde_json::from_slice(&message.payload)?;

    if header.blobs.len() != message.parts.len() {
        return Err(CodecError::PartCountMismatch {
            declared: header.blobs.len(),
            actual: message.parts.len(),
        });
    }

    let blobs = header
        .blobs
        .into_iter()
        .zip(message.parts)
        .map(|(name, data)| match name {
            Some(name) => Blob::named(name, data),
            None => Blob::new(data),
        })
        .collect();

    Ok(Envelope::from_json(header.data, blobs)?)
}
