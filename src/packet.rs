//! Wire packing and unpacking of complete messages.
//!
//! Two layouts are supported. The default TLV layout writes the message id
//! first in network byte order; the legacy LTV layout writes the length
//! first in little-endian. Both carry an 8-byte head followed by the
//! payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{error::FrameError, message::Message};

/// Name of the default big-endian tag-length-value packing.
pub const PACK_TLV_BIG_ENDIAN: &str = "fastnet_pack_tlv_big_endian";
/// Name of the legacy little-endian length-tag-value packing.
pub const PACK_LTV_LITTLE_ENDIAN: &str = "fastnet_pack_ltv_little_endian";

/// Packs messages onto the wire and unpacks complete frames.
pub trait Packer: Send + Sync {
    /// Size of the fixed frame head in bytes.
    fn head_len(&self) -> usize;

    /// Serialize a message into one frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLong`] when the payload exceeds the packer's
    /// maximum packet size.
    fn pack(&self, msg: &Message) -> Result<Bytes, FrameError>;

    /// Parse one complete frame back into a message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Corrupt`] when the frame is shorter than its
    /// head or its declared length disagrees with the data, and
    /// [`FrameError::TooLong`] when the declared length exceeds the maximum
    /// packet size.
    fn unpack(&self, frame: &[u8]) -> Result<Message, FrameError>;
}

/// Select a packer implementation by its registered name.
///
/// Unknown names fall back to the default TLV packing.
#[must_use]
pub fn packer_for(kind: &str, max_packet_size: u32) -> Box<dyn Packer> {
    match kind {
        PACK_LTV_LITTLE_ENDIAN => Box::new(LtvPacker::new(max_packet_size)),
        _ => Box::new(TlvPacker::new(max_packet_size)),
    }
}

/// Default packing: `id(4, BE) | len(4, BE) | payload`.
///
/// The head matches the default [`crate::codec::TlvDecoder`] layout so a
/// packed frame decodes without adjustment.
#[derive(Clone, Debug)]
pub struct TlvPacker {
    max_packet_size: u32,
}

impl TlvPacker {
    /// Build a packer enforcing `max_packet_size` on payloads.
    #[must_use]
    pub fn new(max_packet_size: u32) -> Self { Self { max_packet_size } }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_packet_size as usize {
            return Err(FrameError::TooLong {
                length: len,
                max: self.max_packet_size as usize,
            });
        }
        Ok(())
    }
}

impl Packer for TlvPacker {
    fn head_len(&self) -> usize { 8 }

    fn pack(&self, msg: &Message) -> Result<Bytes, FrameError> {
        self.check_len(msg.len())?;
        let mut buf = BytesMut::with_capacity(self.head_len() + msg.len());
        buf.put_u32(msg.id());
        buf.put_u32(msg.len() as u32);
        buf.put_slice(msg.payload());
        Ok(buf.freeze())
    }

    fn unpack(&self, frame: &[u8]) -> Result<Message, FrameError> {
        if frame.len() < self.head_len() {
            return Err(FrameError::Corrupt("frame shorter than TLV head"));
        }
        let id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        self.check_len(len)?;
        if frame.len() < self.head_len() + len {
            return Err(FrameError::Corrupt("TLV length exceeds frame data"));
        }
        let payload = Bytes::copy_from_slice(&frame[self.head_len()..self.head_len() + len]);
        Ok(Message::new(id, payload))
    }
}

/// Legacy packing: `len(4, LE) | id(4, LE) | payload`.
#[derive(Clone, Debug)]
pub struct LtvPacker {
    max_packet_size: u32,
}

impl LtvPacker {
    /// Build a packer enforcing `max_packet_size` on payloads.
    #[must_use]
    pub fn new(max_packet_size: u32) -> Self { Self { max_packet_size } }
}

impl Packer for LtvPacker {
    fn head_len(&self) -> usize { 8 }

    fn pack(&self, msg: &Message) -> Result<Bytes, FrameError> {
        if msg.len() > self.max_packet_size as usize {
            return Err(FrameError::TooLong {
                length: msg.len(),
                max: self.max_packet_size as usize,
            });
        }
        let mut buf = BytesMut::with_capacity(self.head_len() + msg.len());
        buf.put_u32_le(msg.len() as u32);
        buf.put_u32_le(msg.id());
        buf.put_slice(msg.payload());
        Ok(buf.freeze())
    }

    fn unpack(&self, frame: &[u8]) -> Result<Message, FrameError> {
        if frame.len() < self.head_len() {
            return Err(FrameError::Corrupt("frame shorter than LTV head"));
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let id = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if len > self.max_packet_size as usize {
            return Err(FrameError::TooLong {
                length: len,
                max: self.max_packet_size as usize,
            });
        }
        if frame.len() < self.head_len() + len {
            return Err(FrameError::Corrupt("LTV length exceeds frame data"));
        }
        let payload = Bytes::copy_from_slice(&frame[self.head_len()..self.head_len() + len]);
        Ok(Message::new(id, payload))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::tlv(PACK_TLV_BIG_ENDIAN)]
    #[case::ltv(PACK_LTV_LITTLE_ENDIAN)]
    fn pack_then_unpack_is_identity(#[case] kind: &str) {
        let packer = packer_for(kind, 4096);
        let msg = Message::new(42, Bytes::from_static(b"hello fastnet"));

        let frame = packer.pack(&msg).expect("message should pack");
        let back = packer.unpack(&frame).expect("frame should unpack");

        assert_eq!(back.id(), 42);
        assert_eq!(back.payload().as_ref(), b"hello fastnet");
    }

    #[rstest]
    fn tlv_head_layout_is_big_endian_id_then_len() {
        let packer = TlvPacker::new(64);
        let msg = Message::new(0x0102_0304, Bytes::from_static(b"ab"));
        let frame = packer.pack(&msg).expect("message should pack");
        assert_eq!(&frame[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&frame[4..8], &[0x00, 0x00, 0x00, 0x02]);
    }

    #[rstest]
    fn oversize_payload_is_rejected_both_directions() {
        let packer = TlvPacker::new(4);
        let msg = Message::new(1, Bytes::from_static(b"too big"));
        assert!(matches!(
            packer.pack(&msg),
            Err(FrameError::TooLong { length: 7, max: 4 })
        ));

        // A frame whose head declares an oversize body is rejected before
        // the body is trusted.
        let frame = [0, 0, 0, 1, 0, 0, 1, 0];
        assert!(matches!(
            packer.unpack(&frame),
            Err(FrameError::TooLong { .. })
        ));
    }

    #[rstest]
    fn truncated_frame_is_corrupt() {
        let packer = LtvPacker::new(64);
        assert!(matches!(
            packer.unpack(&[1, 0, 0]),
            Err(FrameError::Corrupt(_))
        ));
        // Declared length longer than the data actually present.
        let frame = [5, 0, 0, 0, 1, 0, 0, 0, b'a'];
        assert!(matches!(
            packer.unpack(&frame),
            Err(FrameError::Corrupt(_))
        ));
    }
}
