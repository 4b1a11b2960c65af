//! Length-field based frame extraction.
//!
//! [`LengthField`] declares where a frame's length lives and how it relates
//! to the bytes that follow; [`FrameExtractor`] applies the descriptor to an
//! accumulating byte stream and yields complete frames.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FrameError;

/// Byte order of the encoded length field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first. The wire default.
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Declarative description of a length-delimited frame layout.
#[derive(Clone, Copy, Debug)]
pub struct LengthField {
    /// Frames longer than this are rejected.
    pub max_frame_length: usize,
    /// Byte offset of the length field from the frame start.
    pub length_field_offset: usize,
    /// Width of the length field in bytes: 1, 2, 3, 4, or 8.
    pub length_field_length: usize,
    /// Signed offset added to the decoded length to yield the byte count
    /// remaining after the length field.
    pub length_adjustment: i64,
    /// Bytes removed from the front of each emitted frame.
    pub initial_bytes_to_strip: usize,
    /// Byte order of the length field.
    pub byte_order: ByteOrder,
}

impl LengthField {
    /// End offset of the length field; a frame header is complete once this
    /// many bytes are buffered.
    #[must_use]
    pub fn length_field_end(&self) -> usize { self.length_field_offset + self.length_field_length }

    fn read_length(&self, buf: &[u8]) -> u64 {
        let raw = &buf[self.length_field_offset..self.length_field_end()];
        raw.iter().enumerate().fold(0_u64, |acc, (i, &b)| {
            let shift = match self.byte_order {
                ByteOrder::BigEndian => (raw.len() - 1 - i) * 8,
                ByteOrder::LittleEndian => i * 8,
            };
            acc | (u64::from(b) << shift)
        })
    }
}

impl Default for LengthField {
    /// Matches the default TLV layout: 4-byte big-endian length at offset 4.
    fn default() -> Self {
        Self {
            max_frame_length: u32::MAX as usize,
            length_field_offset: 4,
            length_field_length: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::BigEndian,
        }
    }
}

/// Stateful extractor applying a [`LengthField`] to a byte stream.
///
/// One extractor serves one connection; it owns the partial-frame
/// accumulator between reads. When a declared frame exceeds the maximum the
/// extractor reports the violation once, then silently discards the rest of
/// that frame as it arrives so the stream can resynchronize.
#[derive(Debug)]
pub struct FrameExtractor {
    field: LengthField,
    accum: BytesMut,
    discard_remaining: usize,
}

impl FrameExtractor {
    /// Build an extractor for `field`.
    ///
    /// Descriptor validity (field width, strip bound) is checked on first
    /// use rather than here so a server can hold an extractor for a decoder
    /// configured later.
    #[must_use]
    pub fn new(field: LengthField) -> Self {
        Self {
            field,
            accum: BytesMut::new(),
            discard_remaining: 0,
        }
    }

    /// Append freshly read bytes to the accumulator.
    pub fn push(&mut self, data: &[u8]) { self.accum.extend_from_slice(data); }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// [`FrameError::TooLong`] when a declared frame exceeds
    /// `max_frame_length` (reported once per oversize frame) and
    /// [`FrameError::Corrupt`] when the descriptor and the data disagree.
    pub fn try_next(&mut self) -> Result<Option<Bytes>, FrameError> {
        if !matches!(self.field.length_field_length, 1 | 2 | 3 | 4 | 8) {
            return Err(FrameError::Corrupt("unsupported length field width"));
        }
        if self.drain_discard() {
            return Ok(None);
        }

        let header_end = self.field.length_field_end();
        if self.accum.len() < header_end {
            return Ok(None);
        }

        let unadjusted = self.field.read_length(&self.accum);
        let frame_length = unadjusted as i64 + self.field.length_adjustment + header_end as i64;
        if frame_length < header_end as i64 {
            return Err(FrameError::Corrupt("length adjustment yields negative body"));
        }
        let frame_length = frame_length as usize;

        if frame_length > self.field.max_frame_length {
            // Skip the oversize frame; report the violation once.
            self.discard_remaining = frame_length;
            self.drain_discard();
            return Err(FrameError::TooLong {
                length: frame_length,
                max: self.field.max_frame_length,
            });
        }
        if self.accum.len() < frame_length {
            return Ok(None);
        }

        let strip = self.field.initial_bytes_to_strip;
        if strip > frame_length {
            return Err(FrameError::Corrupt("strip exceeds frame length"));
        }
        let mut frame = self.accum.split_to(frame_length);
        frame.advance(strip);
        Ok(Some(frame.freeze()))
    }

    /// Bytes currently buffered awaiting a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize { self.accum.len() }

    fn drain_discard(&mut self) -> bool {
        if self.discard_remaining == 0 {
            return false;
        }
        let drop = self.discard_remaining.min(self.accum.len());
        self.accum.advance(drop);
        self.discard_remaining -= drop;
        self.discard_remaining > 0
    }
}
