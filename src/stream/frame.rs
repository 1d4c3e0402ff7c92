//! RTCM3 frame extraction from an unbounded byte stream.
//!
//! [`FrameParser`] is a pure transform with no I/O: bytes go in via
//! [`FrameParser::push`], complete CRC-validated frames come out via
//! [`FrameParser::next_frame`]. Partial frames stay buffered until the
//! remaining bytes arrive; they are never emitted.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

/// First byte of every RTCM3 frame.
pub const RTCM3_PREAMBLE: u8 = 0xD3;

const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 3;

/// CRC24Q generator polynomial (used by RTCM3 and the Qualcomm CDMA
/// family this checksum is named after).
const CRC24Q_POLY: u32 = 0x0186_4CFB;

const CRC24Q_TABLE: [u32; 256] = crc24q_table();

const fn crc24q_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
            bit += 1;
        }
        table[i] = crc & 0x00FF_FFFF;
        i += 1;
    }
    table
}

/// Computes the CRC24Q checksum of `data` (init 0, no reflection).
pub fn crc24q(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        let index = (((crc >> 16) as u8) ^ byte) as usize;
        crc = ((crc << 8) ^ CRC24Q_TABLE[index]) & 0x00FF_FFFF;
    }
    crc
}

/// One complete, CRC-validated RTCM3 message.
///
/// Holds the full wire bytes: preamble, 2-byte length header, payload,
/// and trailing 3-byte CRC24Q.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RtcmFrame {
    bytes: Bytes,
}

impl RtcmFrame {
    /// Full wire bytes of the frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the frame, returning the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Payload bytes between the length header and the CRC.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - CRC_LEN]
    }

    /// RTCM message number from the top 12 payload bits.
    ///
    /// Diagnostic only; framing never depends on it. `None` when the
    /// payload is shorter than the message-number field.
    pub fn message_type(&self) -> Option<u16> {
        let payload = self.payload();
        if payload.len() < 2 {
            return None;
        }
        Some(((payload[0] as u16) << 4) | ((payload[1] as u16) >> 4))
    }

    /// Total frame length in bytes, headers and CRC included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the frame holds no bytes (never for parser output).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Incremental RTCM3 frame decoder.
///
/// Bytes preceding a preamble are discarded. A candidate frame whose
/// reserved header bits are set or whose CRC does not match is rejected
/// by advancing a single byte past its preamble, which recovers
/// synchronization without skipping data that might belong to the next
/// real frame.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
    crc_failures: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(2048),
            crc_failures: 0,
        }
    }

    /// Appends raw bytes read from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extracts the next complete frame, or `None` if more bytes are
    /// needed. Call repeatedly after each `push` to drain all frames.
    pub fn next_frame(&mut self) -> Option<RtcmFrame> {
        loop {
            match self.buf.iter().position(|&b| b == RTCM3_PREAMBLE) {
                Some(0) => {}
                Some(skip) => self.buf.advance(skip),
                None => {
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            // Top 6 bits of the length field are reserved and zero in a
            // real frame; anything else is a stray 0xD3 in the stream.
            if self.buf[1] & 0xFC != 0 {
                self.resync("reserved header bits set");
                continue;
            }

            let payload_len = (((self.buf[1] & 0x03) as usize) << 8) | self.buf[2] as usize;
            let total = HEADER_LEN + payload_len + CRC_LEN;
            if self.buf.len() < total {
                return None;
            }

            let expected = crc24q(&self.buf[..HEADER_LEN + payload_len]);
            let tail = &self.buf[HEADER_LEN + payload_len..total];
            let actual = ((tail[0] as u32) << 16) | ((tail[1] as u32) << 8) | tail[2] as u32;
            if expected != actual {
                self.resync("crc mismatch");
                continue;
            }

            let bytes = self.buf.split_to(total).freeze();
            return Some(RtcmFrame { bytes });
        }
    }

    fn resync(&mut self, reason: &'static str) {
        self.crc_failures += 1;
        debug!(reason, failures = self.crc_failures, "dropping candidate frame, resynchronizing");
        self.buf.advance(1);
    }

    /// Bytes currently buffered waiting for a frame to complete.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Number of candidate frames rejected since construction.
    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }
}
