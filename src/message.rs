//! The unit of dispatch: a framed binary message.

use bytes::Bytes;

/// One application message extracted from the wire.
///
/// A decoder may rewrite the id while parsing (for example deriving it from a
/// function-code field). Once the message reaches a router, handlers treat id
/// and payload as read-only.
#[derive(Clone, Debug, Default)]
pub struct Message {
    id: u32,
    payload: Bytes,
    /// Complete frame bytes as received, before any stripping.
    raw: Option<Bytes>,
}

impl Message {
    /// Build a message with an id and payload.
    #[must_use]
    pub fn new(id: u32, payload: Bytes) -> Self {
        Self {
            id,
            payload,
            raw: None,
        }
    }

    /// Build a message from raw frame bytes awaiting semantic decode.
    ///
    /// The payload initially aliases the raw frame; the head decoder
    /// replaces it with the extracted body.
    #[must_use]
    pub fn from_raw(raw: Bytes) -> Self {
        Self {
            id: 0,
            payload: raw.clone(),
            raw: Some(raw),
        }
    }

    /// Message id used for routing.
    #[must_use]
    pub fn id(&self) -> u32 { self.id }

    /// Rewrite the message id. Decoder-only by convention.
    pub fn set_id(&mut self, id: u32) { self.id = id; }

    /// Application payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Replace the payload bytes.
    pub fn set_payload(&mut self, payload: Bytes) { self.payload = payload; }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.payload.len() }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.payload.is_empty() }

    /// Raw frame bytes, when the message came off the wire.
    #[must_use]
    pub fn raw(&self) -> Option<&Bytes> { self.raw.as_ref() }
}
