//! Frame boundary extraction and head-of-chain decoders.
//!
//! Framing happens in two layers. A per-connection [`FrameExtractor`] splits
//! the raw byte stream into complete frames using a declarative
//! [`LengthField`] descriptor; a [`FrameDecoder`] then runs at the head of
//! the interceptor chain to parse the complete frame, set the routing id,
//! and expose the decoded body.

mod htlv_crc;
mod length_field;
mod tlv;

pub use htlv_crc::{HtlvCrcDecoder, HtlvFrame, crc16};
pub use length_field::{ByteOrder, FrameExtractor, LengthField};
pub use tlv::{TlvDecoder, TlvFrame};

use crate::interceptor::Interceptor;

/// A decoder installable at the head of the interceptor chain.
///
/// The length field describes how the server's connection readers delimit
/// frames before the decoder sees them; `None` means the stream is already
/// message-delimited (for example WebSocket binary messages).
pub trait FrameDecoder: Interceptor {
    /// Descriptor for the connection-level frame extractor.
    fn length_field(&self) -> Option<LengthField>;
}
