//! Default tag-length-value decoder.

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteOrder, FrameDecoder, LengthField};
use crate::{
    error::FrameError,
    interceptor::{Chain, IcResponse, Interceptor},
};

/// Fixed head size: `id(4) | len(4)`.
pub const TLV_HEAD_SIZE: usize = 8;

/// Parsed TLV frame stored in the request's response slot.
#[derive(Clone, Debug)]
pub struct TlvFrame {
    /// Routing tag.
    pub id: u32,
    /// Declared body length.
    pub length: u32,
    /// Body bytes.
    pub value: Bytes,
}

/// Decoder for the default wire layout `id(4, BE) | len(4, BE) | body`.
///
/// Complements [`crate::packet::TlvPacker`]: a packed frame decodes to the
/// message that produced it.
#[derive(Clone, Debug)]
pub struct TlvDecoder {
    max_body_len: usize,
}

impl TlvDecoder {
    /// Build a decoder accepting bodies up to `max_body_len` bytes.
    #[must_use]
    pub fn new(max_body_len: usize) -> Self { Self { max_body_len } }
}

impl Default for TlvDecoder {
    fn default() -> Self { Self::new(4096) }
}

impl FrameDecoder for TlvDecoder {
    fn length_field(&self) -> Option<LengthField> {
        Some(LengthField {
            max_frame_length: self.max_body_len + TLV_HEAD_SIZE,
            length_field_offset: 4,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::BigEndian,
        })
    }
}

#[async_trait]
impl Interceptor for TlvDecoder {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
        let Some(message) = chain.message() else {
            return chain.proceed().await;
        };
        let data = message.payload().clone();
        if data.len() < TLV_HEAD_SIZE {
            // Not even a full head yet; flow on unchanged.
            return chain.proceed_with_decoded(IcResponse::noop()).await;
        }

        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if data.len() < TLV_HEAD_SIZE + length as usize {
            return Err(FrameError::Corrupt("TLV length exceeds frame data"));
        }
        let value = data.slice(TLV_HEAD_SIZE..TLV_HEAD_SIZE + length as usize);

        if let Some(message) = chain.message_mut() {
            message.set_id(id);
            message.set_payload(value.clone());
        }
        chain
            .proceed_with_decoded(IcResponse::with_value(TlvFrame { id, length, value }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::{
        interceptor::ChainBuilder,
        message::Message,
        packet::{Packer, TlvPacker},
        request::Request,
    };

    struct Capture;

    #[async_trait]
    impl Interceptor for Capture {
        async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
            let request = chain.request().expect("request should be present");
            let frame = request
                .response()
                .downcast_ref::<TlvFrame>()
                .expect("decoded frame should be present")
                .clone();
            Ok(IcResponse::with_value(frame))
        }
    }

    #[rstest]
    #[tokio::test]
    async fn decodes_a_packed_frame() {
        let packer = TlvPacker::new(64);
        let wire = packer
            .pack(&Message::new(7, Bytes::from_static(b"ping")))
            .expect("message should pack");

        let mut builder = ChainBuilder::new();
        builder.set_head(Arc::new(TlvDecoder::default()));
        builder.set_tail(Arc::new(Capture));

        let response = builder
            .execute(Request::detached(Message::from_raw(wire)))
            .await
            .expect("chain should succeed");
        let frame = response
            .downcast_ref::<TlvFrame>()
            .expect("capture should return the frame");
        assert_eq!(frame.id, 7);
        assert_eq!(frame.value.as_ref(), b"ping");
    }

    #[rstest]
    #[tokio::test]
    async fn short_data_flows_through_undecoded() {
        let mut builder = ChainBuilder::new();
        builder.set_head(Arc::new(TlvDecoder::default()));

        let response = builder
            .execute(Request::detached(Message::from_raw(Bytes::from_static(
                b"\x00\x01",
            ))))
            .await
            .expect("chain should succeed");
        assert!(response.is_noop());
    }

    #[rstest]
    #[tokio::test]
    async fn declared_length_beyond_data_is_corrupt() {
        let mut builder = ChainBuilder::new();
        builder.set_head(Arc::new(TlvDecoder::default()));

        let err = builder
            .execute(Request::detached(Message::from_raw(Bytes::from_static(
                b"\x00\x00\x00\x07\x00\x00\x00\x09ab",
            ))))
            .await
            .expect_err("inconsistent frame must fail");
        assert!(matches!(err, FrameError::Corrupt(_)));
    }
}
