//! Frame encoding/decoding.
//!
//! Every message on the link is one frame:
//!
//! ```text
//! +------+-----+------+------------------+-----+
//! | SYNC | LEN | TYPE | PAYLOAD[0..252]  | CRC |
//! +------+-----+------+------------------+-----+
//! ```
//!
//! LEN counts TYPE, PAYLOAD, and CRC (so payload length + 2). CRC is CRC-8
//! DVB-S2 over TYPE and PAYLOAD only. Addressed protocol variants place
//! DEST/ORIGIN bytes at the start of the payload region; the codec treats
//! the payload as opaque either way.

use bytes::{Buf, BytesMut};

use crate::constants::*;
use crate::error::FrameError;

/// CRC-8 DVB-S2 lookup table (polynomial 0xD5, init 0).
const CRC8_LUT: [u8; 256] = [
    0x00, 0xD5, 0x7F, 0xAA, 0xFE, 0x2B, 0x81, 0x54, 0x29, 0xFC, 0x56, 0x83, 0xD7, 0x02, 0xA8, 0x7D,
    0x52, 0x87, 0x2D, 0xF8, 0xAC, 0x79, 0xD3, 0x06, 0x7B, 0xAE, 0x04, 0xD1, 0x85, 0x50, 0xFA, 0x2F,
    0xA4, 0x71, 0xDB, 0x0E, 0x5A, 0x8F, 0x25, 0xF0, 0x8D, 0x58, 0xF2, 0x27, 0x73, 0xA6, 0x0C, 0xD9,
    0xF6, 0x23, 0x89, 0x5C, 0x08, 0xDD, 0x77, 0xA2, 0xDF, 0x0A, 0xA0, 0x75, 0x21, 0xF4, 0x5E, 0x8B,
    0x9D, 0x48, 0xE2, 0x37, 0x63, 0xB6, 0x1C, 0xC9, 0xB4, 0x61, 0xCB, 0x1E, 0x4A, 0x9F, 0x35, 0xE0,
    0xCF, 0x1A, 0xB0, 0x65, 0x31, 0xE4, 0x4E, 0x9B, 0xE6, 0x33, 0x99, 0x4C, 0x18, 0xCD, 0x67, 0xB2,
    0x39, 0xEC, 0x46, 0x93, 0xC7, 0x12, 0xB8, 0x6D, 0x10, 0xC5, 0x6F, 0xBA, 0xEE, 0x3B, 0x91, 0x44,
    0x6B, 0xBE, 0x14, 0xC1, 0x95, 0x40, 0xEA, 0x3F, 0x42, 0x97, 0x3D, 0xE8, 0xBC, 0x69, 0xC3, 0x16,
    0xEF, 0x3A, 0x90, 0x45, 0x11, 0xC4, 0x6E, 0xBB, 0xC6, 0x13, 0xB9, 0x6C, 0x38, 0xED, 0x47, 0x92,
    0xBD, 0x68, 0xC2, 0x17, 0x43, 0x96, 0x3C, 0xE9, 0x94, 0x41, 0xEB, 0x3E, 0x6A, 0xBF, 0x15, 0xC0,
    0x4B, 0x9E, 0x34, 0xE1, 0xB5, 0x60, 0xCA, 0x1F, 0x62, 0xB7, 0x1D, 0xC8, 0x9C, 0x49, 0xE3, 0x36,
    0x19, 0xCC, 0x66, 0xB3, 0xE7, 0x32, 0x98, 0x4D, 0x30, 0xE5, 0x4F, 0x9A, 0xCE, 0x1B, 0xB1, 0x64,
    0x72, 0xA7, 0x0D, 0xD8, 0x8C, 0x59, 0xF3, 0x26, 0x5B, 0x8E, 0x24, 0xF1, 0xA5, 0x70, 0xDA, 0x0F,
    0x20, 0xF5, 0x5F, 0x8A, 0xDE, 0x0B, 0xA1, 0x74, 0x09, 0xDC, 0x76, 0xA3, 0xF7, 0x22, 0x88, 0x5D,
    0xD6, 0x03, 0xA9, 0x7C, 0x28, 0xFD, 0x57, 0x82, 0xFF, 0x2A, 0x80, 0x55, 0x01, 0xD4, 0x7E, 0xAB,
    0x84, 0x51, 0xFB, 0x2E, 0x7A, 0xAF, 0x05, 0xD0, 0xAD, 0x78, 0xD2, 0x07, 0x53, 0x86, 0x2C, 0xF9,
];

/// Compute the CRC-8 DVB-S2 checksum of `data`.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc = CRC8_LUT[(crc ^ byte) as usize];
    }
    crc
}

/// One decoded frame: message type plus payload, framing stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type byte.
    pub msg_type: u8,
    /// Payload bytes (may be empty).
    pub payload: Vec<u8>,
}

/// Encode a complete frame for transmission.
pub fn encode_frame(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD,
            actual: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(SYNC_BYTE);
    frame.push((payload.len() + 2) as u8);
    frame.push(msg_type);
    frame.extend_from_slice(payload);

    let crc = crc8(&frame[2..]);
    frame.push(crc);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Push received bytes in as they arrive and pull complete frames out.
/// Garbage before the sync byte is skipped; a LEN byte outside the legal
/// range or a CRC mismatch is reported once and the decoder resynchronizes
/// on the next sync byte.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        FrameDecoder {
            buffer: BytesMut::with_capacity(MAX_LEN_FIELD + FRAME_OVERHEAD),
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode a complete frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` when a complete valid frame is available,
    /// `Ok(None)` when more data is needed, or an error for a frame that
    /// arrived complete but invalid. After an error the offending bytes are
    /// consumed, so callers may keep pulling.
    pub fn try_decode(&mut self) -> Result<Option<Frame>, FrameError> {
        // Skip anything before the sync byte.
        while !self.buffer.is_empty() && self.buffer[0] != SYNC_BYTE {
            self.buffer.advance(1);
        }

        if self.buffer.len() < 2 {
            return Ok(None);
        }

        let len = self.buffer[1] as usize;
        if !(MIN_LEN_FIELD..=MAX_LEN_FIELD).contains(&len) {
            // Drop the sync byte and resynchronize.
            self.buffer.advance(1);
            return Err(FrameError::BadLen(len as u8));
        }

        if self.buffer.len() < 2 + len {
            return Ok(None);
        }

        self.buffer.advance(2);
        let body = self.buffer.split_to(len);

        let crc_index = len - 1;
        let expected = crc8(&body[..crc_index]);
        let actual = body[crc_index];
        if expected != actual {
            return Err(FrameError::CrcMismatch { expected, actual });
        }

        Ok(Some(Frame {
            msg_type: body[0],
            payload: body[1..crc_index].to_vec(),
        }))
    }

    /// Number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard all buffered bytes, including any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
