//! Tunnel envelope.
//!
//! ```text
//!  0         1          2              4             6              8
//!  +---------+----------+--------------+-------------+--------------+------------
//!  | version | reserved | session (BE) | length (BE) | checksum(BE) | packet ...
//!  +---------+----------+--------------+-------------+--------------+------------
//! ```
//!
//! `session` is the translation port of the flow the packet belongs to. The
//! checksum is the Internet checksum of the whole envelope with the checksum
//! field taken as zero. One envelope always carries one whole IP packet.

use pnet::util::checksum;

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_PACKET_LEN: usize = u16::MAX as usize;

const CHECKSUM_WORD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated envelope: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("envelope checksum mismatch: carried {carried:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("{0} unexpected bytes after envelope")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("packet of {0} bytes does not fit in an envelope")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub session: u16,
    pub packet: Vec<u8>,
}

/// Wraps `packet` for the flow holding translation port `session`.
pub fn encode(packet: &[u8], session: u16) -> Result<Vec<u8>, EncodeError> {
    if packet.len() > MAX_PACKET_LEN {
        return Err(EncodeError::TooLarge(packet.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + packet.len());
    buf.push(VERSION);
    buf.push(0);
    buf.extend_from_slice(&session.to_be_bytes());
    buf.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(packet);

    let sum = checksum(&buf, CHECKSUM_WORD);
    buf[6..8].copy_from_slice(&sum.to_be_bytes());
    Ok(buf)
}

/// Unwraps an envelope. Total over arbitrary input.
pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            expected: HEADER_LEN,
            actual: buf.len(),
        });
    }
    if buf[0] != VERSION {
        return Err(DecodeError::UnsupportedVersion(buf[0]));
    }

    let session = u16::from_be_bytes([buf[2], buf[3]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let expected = HEADER_LEN + length;
    if buf.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    if buf.len() > expected {
        return Err(DecodeError::TrailingBytes(buf.len() - expected));
    }

    let carried = u16::from_be_bytes([buf[6], buf[7]]);
    let computed = checksum(buf, CHECKSUM_WORD);
    if carried != computed {
        return Err(DecodeError::ChecksumMismatch { carried, computed });
    }

    Ok(Envelope {
        session,
        packet: buf[HEADER_LEN..].to_vec(),
    })
}
