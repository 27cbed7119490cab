//! Frame codec for the presence IPC channel
//!
//! Every frame is an 8-byte little-endian header followed by the payload:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────┐
//! │ Opcode (4 bytes) │ Length (4 bytes) │ Payload (variable)  │
//! │ i32 LE           │ i32 LE           │ UTF-8 JSON          │
//! └──────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! The channel is a reliable local stream, so a frame is read in two steps:
//! the fixed header, then exactly `length` body bytes. The codec does not
//! validate opcodes; callers decide what to do with ones they don't know.

use crate::error::CodecError;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 8;

/// Known opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Handshake,
    Message,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn code(self) -> i32 {
        match self {
            Opcode::Handshake => 0,
            Opcode::Message => 1,
            Opcode::Close => 2,
            Opcode::Ping => 3,
            Opcode::Pong => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Opcode::Handshake),
            1 => Some(Opcode::Message),
            2 => Some(Opcode::Close),
            3 => Some(Opcode::Ping),
            4 => Some(Opcode::Pong),
            _ => None,
        }
    }
}

/// Build the 8-byte header for a payload of `len` bytes
pub fn encode_header(opcode: i32, len: usize) -> Result<[u8; HEADER_LEN], CodecError> {
    let len = i32::try_from(len).map_err(|_| CodecError::PayloadTooLarge(len))?;

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&opcode.to_le_bytes());
    header[4..].copy_from_slice(&len.to_le_bytes());
    Ok(header)
}

/// Encode a whole frame (header followed by payload)
pub fn encode(opcode: i32, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let header = encode_header(opcode, payload.len())?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a frame header into `(opcode, payload length)`
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(i32, usize), CodecError> {
    let opcode = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let len = usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))?;
    Ok((opcode, len))
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// The opcode, if it is one this crate knows
    pub fn kind(&self) -> Option<Opcode> {
        Opcode::from_code(self.opcode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(frame: &[u8]) -> ([u8; HEADER_LEN], &[u8]) {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        (header, &frame[HEADER_LEN..])
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let frame = encode(Opcode::Message.code(), b"abc").unwrap();
        assert_eq!(&frame[..HEADER_LEN], &[1, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(&frame[HEADER_LEN..], b"abc");
    }

    #[test]
    fn test_round_trip_preserves_opcode_and_body() {
        let payloads: [&[u8]; 3] = [b"", b"{\"v\":1}", &[0xff; 300]];
        for opcode in [0, 1, -7, i32::MAX] {
            for payload in payloads {
                let frame = encode(opcode, payload).unwrap();
                let (header, body) = split(&frame);
                assert_eq!(decode_header(&header).unwrap(), (opcode, payload.len()));
                assert_eq!(body, payload);
            }
        }
    }

    #[test]
    fn test_empty_payload_is_legal() {
        let frame = encode(Opcode::Handshake.code(), &[]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        let (header, _) = split(&frame);
        assert_eq!(decode_header(&header).unwrap(), (0, 0));
    }

    #[test]
    fn test_unknown_opcode_passes_through() {
        let header = encode_header(42, 5).unwrap();
        let (opcode, len) = decode_header(&header).unwrap();
        assert_eq!((opcode, len), (42, 5));
        assert_eq!(Opcode::from_code(opcode), None);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[4..].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            decode_header(&header),
            Err(CodecError::NegativeLength(-1))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let too_big = i32::MAX as usize + 1;
        assert!(matches!(
            encode_header(1, too_big),
            Err(CodecError::PayloadTooLarge(n)) if n == too_big
        ));
    }
}
