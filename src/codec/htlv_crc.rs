//! HTLV decoder with CRC-16 verification.
//!
//! Wire layout:
//!
//! ```text
//! +------+------+-----+-----------+--------+
//! | head | func | len | body      | crc    |
//! | 1 B  | 1 B  | 1 B | len bytes | 2 B    |
//! +------+------+-----+-----------+--------+
//! ```
//!
//! `len` counts only the body, so the length adjustment covers the 2-byte
//! CRC trailer. The CRC is CRC-16/MODBUS over everything before the
//! trailer, transmitted low byte first.

use async_trait::async_trait;
use bytes::Bytes;

use super::{ByteOrder, FrameDecoder, LengthField};
use crate::{
    error::FrameError,
    interceptor::{Chain, IcResponse, Interceptor},
};

/// Minimum complete frame: head, func, len, empty body, CRC.
pub const HTLV_MIN_FRAME: usize = 5;

/// Default body ceiling, matching the signed-8-bit limit of the original
/// protocol generation. Peers negotiating larger bodies use
/// [`HtlvCrcDecoder::with_max_body_len`].
pub const HTLV_DEFAULT_MAX_BODY: usize = 127;

/// Parsed HTLV frame stored in the request's response slot.
#[derive(Clone, Debug)]
pub struct HtlvFrame {
    /// Header code.
    pub head: u8,
    /// Function code; becomes the routing id.
    pub func_code: u8,
    /// Declared body length.
    pub length: u8,
    /// Body bytes.
    pub body: Bytes,
    /// Verified CRC as received.
    pub crc: [u8; 2],
    /// The complete frame as received.
    pub raw: Bytes,
}

/// Head-of-chain decoder for the HTLV/CRC layout.
#[derive(Clone, Debug)]
pub struct HtlvCrcDecoder {
    max_body_len: usize,
}

impl HtlvCrcDecoder {
    /// Decoder with the default body ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_body_len: HTLV_DEFAULT_MAX_BODY,
        }
    }

    /// Decoder accepting bodies up to `max_body_len` bytes (at most 255,
    /// the representable range of the 1-byte length field).
    #[must_use]
    pub fn with_max_body_len(max_body_len: usize) -> Self {
        Self {
            max_body_len: max_body_len.min(u8::MAX as usize),
        }
    }
}

impl Default for HtlvCrcDecoder {
    fn default() -> Self { Self::new() }
}

impl FrameDecoder for HtlvCrcDecoder {
    fn length_field(&self) -> Option<LengthField> {
        Some(LengthField {
            // head + func + len + CRC surround the counted body.
            max_frame_length: self.max_body_len + HTLV_MIN_FRAME,
            length_field_offset: 2,
            length_field_length: 1,
            length_adjustment: 2,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::BigEndian,
        })
    }
}

#[async_trait]
impl Interceptor for HtlvCrcDecoder {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<IcResponse, FrameError> {
        let Some(message) = chain.message() else {
            return chain.proceed().await;
        };
        let data = message.payload().clone();
        if data.len() < HTLV_MIN_FRAME {
            return chain.proceed_with_decoded(IcResponse::noop()).await;
        }

        let frame = decode(&data)?;
        if let Some(message) = chain.message_mut() {
            message.set_id(u32::from(frame.func_code));
            message.set_payload(frame.body.clone());
        }
        chain
            .proceed_with_decoded(IcResponse::with_value(frame))
            .await
    }
}

fn decode(data: &Bytes) -> Result<HtlvFrame, FrameError> {
    let len = data.len();
    let length = data[2];
    if usize::from(length) + 5 != len {
        return Err(FrameError::Corrupt("HTLV length disagrees with frame size"));
    }

    let crc = [data[len - 2], data[len - 1]];
    let actual = u16::from_le_bytes(crc);
    let expected = crc16(&data[..len - 2]);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }

    Ok(HtlvFrame {
        head: data[0],
        func_code: data[1],
        length,
        body: data.slice(3..len - 2),
        crc,
        raw: data.clone(),
    })
}

/// CRC-16/MODBUS: polynomial `0xA001` (reflected), initial value `0xFFFF`.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF_u16;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}
