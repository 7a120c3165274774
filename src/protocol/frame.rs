//! Wire framing around an opaque payload.
//!
//! Layout, fixed:
//! `magic(2) | payload_len(4 LE) | seq(2 LE) | command(1) | format(1) |
//! payload | checksum(1) | trailer(2)` — 13 bytes of envelope around the
//! payload. The checksum is CRC-8 (polynomial 0x07, seed 0) over everything
//! from `payload_len` through the end of the payload.

use bytes::{BufMut, BytesMut};

use crate::error::{EngineError, ProtocolViolation, Result};
use crate::protocol::command::{Command, FormatByte};

/// Leading magic bytes. The 16-bit value 0xAA55 on the wire.
pub const MAGIC: [u8; 2] = [0xAA, 0x55];
/// Closing trailer bytes. The 16-bit value 0x55AA on the wire.
pub const TRAILER: [u8; 2] = [0x55, 0xAA];
/// Envelope bytes around the payload.
pub const ENVELOPE_LEN: usize = 13;
/// Hard cap on the payload carried by a single frame.
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 10; // magic + payload_len + seq + command + format

/// A parsed frame. The payload is owned; header fields are unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u16,
    pub command: Command,
    pub format: FormatByte,
    pub payload: Vec<u8>,
}

/// Outcome of a single parse attempt against a receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full frame was decoded; `consumed` bytes must be dropped from the
    /// front of the buffer.
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes yet for a complete frame.
    NeedMore,
    /// No magic at position 0 but one was found at `skip`; the caller drops
    /// the prefix and retries.
    ResyncSkip(usize),
}

/// CRC-8, polynomial 0x07, seed 0, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Serialise one frame.
///
/// Refuses payloads above [`MAX_PAYLOAD_LEN`]; the encoded length is always
/// `13 + payload.len()`.
pub fn encode(command: Command, format: FormatByte, payload: &[u8], seq: u16) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EngineError::protocol(
            ProtocolViolation::LengthExceeded,
            format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_PAYLOAD_LEN
            ),
        ));
    }

    let mut buf = BytesMut::with_capacity(ENVELOPE_LEN + payload.len());
    buf.put_slice(&MAGIC);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u16_le(seq);
    buf.put_u8(command as u8);
    buf.put_u8(format.0);
    buf.put_slice(payload);
    // Checksum covers payload_len..payload, i.e. everything after the magic.
    let crc = crc8(&buf[MAGIC.len()..]);
    buf.put_u8(crc);
    buf.put_slice(&TRAILER);
    Ok(buf.to_vec())
}

/// Attempt to parse one frame from the front of `buf`.
///
/// Checksum or trailer mismatch inside a well-delimited frame is a hard
/// [`EngineError::Protocol`]; the caller must reset the connection and not
/// touch the payload.
pub fn try_parse(buf: &[u8]) -> Result<ParseOutcome> {
    if buf.len() < MAGIC.len() {
        return Ok(ParseOutcome::NeedMore);
    }

    if buf[..MAGIC.len()] != MAGIC {
        return match find_magic(buf, 1) {
            Some(pos) => Ok(ParseOutcome::ResyncSkip(pos)),
            // No magic anywhere; everything but the last byte (a potential
            // first magic byte) is garbage.
            None => {
                if buf[buf.len() - 1] == MAGIC[0] {
                    Ok(ParseOutcome::ResyncSkip(buf.len() - 1))
                } else {
                    Err(EngineError::protocol(
                        ProtocolViolation::BadMagic,
                        format!("no frame magic in {} buffered bytes", buf.len()),
                    ))
                }
            }
        };
    }

    if buf.len() < HEADER_LEN {
        return Ok(ParseOutcome::NeedMore);
    }

    let payload_len = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(EngineError::protocol(
            ProtocolViolation::LengthExceeded,
            format!("frame declares a {payload_len} byte payload"),
        ));
    }

    let total = ENVELOPE_LEN + payload_len;
    if buf.len() < total {
        return Ok(ParseOutcome::NeedMore);
    }

    let trailer_at = HEADER_LEN + payload_len + 1;
    if buf[trailer_at..trailer_at + TRAILER.len()] != TRAILER {
        return Err(EngineError::protocol(
            ProtocolViolation::BadTrailer,
            "frame trailer mismatch",
        ));
    }

    let expected = buf[HEADER_LEN + payload_len];
    let actual = crc8(&buf[MAGIC.len()..HEADER_LEN + payload_len]);
    if expected != actual {
        return Err(EngineError::protocol(
            ProtocolViolation::BadChecksum,
            format!("crc mismatch: frame carries 0x{expected:02x}, computed 0x{actual:02x}"),
        ));
    }

    let seq = u16::from_le_bytes([buf[6], buf[7]]);
    let command = Command::from_byte(buf[8])?;
    let format = FormatByte(buf[9]);
    format.validate()?;

    Ok(ParseOutcome::Frame {
        frame: Frame {
            seq,
            command,
            format,
            payload: buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        },
        consumed: total,
    })
}

/// Find the next magic occurrence at or after `from`.
pub fn find_magic(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < MAGIC.len() {
        return None;
    }
    (from..=buf.len() - MAGIC.len()).find(|&i| buf[i..i + MAGIC.len()] == MAGIC)
}

/// Find the last magic occurrence, scanning backward from the tail. Used by
/// the receive buffer to salvage one potentially incomplete frame when it
/// overflows.
pub fn rfind_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < MAGIC.len() {
        return None;
    }
    (0..=buf.len() - MAGIC.len())
        .rev()
        .find(|&i| buf[i..i + MAGIC.len()] == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(buf: &[u8]) -> Frame {
        match try_parse(buf).unwrap() {
            ParseOutcome::Frame { frame, consumed } => {
                assert_eq!(consumed, buf.len());
                frame
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn crc8_known_vectors() {
        // CRC-8/SMBUS of "123456789" is 0xF4.
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc8(b""), 0x00);
    }

    #[test]
    fn encode_parse_round_trip() {
        for payload in [&b""[..], &b"x"[..], &[0u8; 1024][..]] {
            let encoded =
                encode(Command::UploadData, FormatByte::protobuf(), payload, 0x1234).unwrap();
            assert_eq!(encoded.len(), ENVELOPE_LEN + payload.len());
            let frame = parse_one(&encoded);
            assert_eq!(frame.seq, 0x1234);
            assert_eq!(frame.command, Command::UploadData);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn oversized_payload_is_refused_at_encode() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        assert!(encode(Command::UploadData, FormatByte::protobuf(), &payload, 0).is_ok());
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let err = encode(Command::UploadData, FormatByte::protobuf(), &payload, 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol {
                violation: ProtocolViolation::LengthExceeded,
                ..
            }
        ));
    }

    #[test]
    fn bit_flips_are_detected() {
        let encoded = encode(
            Command::FileInfo,
            FormatByte::protobuf(),
            b"some payload bytes",
            7,
        )
        .unwrap();
        // Flip one bit in every position after the magic and before the
        // trailer; each must fail checksum (or trailer for the crc byte run).
        for pos in MAGIC.len()..encoded.len() - TRAILER.len() {
            let mut corrupted = encoded.clone();
            corrupted[pos] ^= 0x01;
            match try_parse(&corrupted) {
                Err(EngineError::Protocol { violation, .. }) => {
                    assert!(
                        matches!(
                            violation,
                            ProtocolViolation::BadChecksum
                                | ProtocolViolation::BadTrailer
                                | ProtocolViolation::LengthExceeded
                        ),
                        "unexpected violation {violation:?} at byte {pos}"
                    );
                }
                // A flipped length byte can shorten the frame into NeedMore.
                Ok(ParseOutcome::NeedMore) => {}
                other => panic!("corruption at byte {pos} went unnoticed: {other:?}"),
            }
        }
    }

    #[test]
    fn magic_corruption_resyncs() {
        let encoded = encode(Command::Ping, FormatByte::protobuf(), b"", 1).unwrap();
        let mut stream = vec![0x00, 0x17, 0x2a];
        stream.extend_from_slice(&encoded);
        match try_parse(&stream).unwrap() {
            ParseOutcome::ResyncSkip(skip) => assert_eq!(skip, 3),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[test]
    fn partial_frames_need_more() {
        let encoded = encode(Command::Pong, FormatByte::protobuf(), b"abcdef", 2).unwrap();
        for cut in 0..encoded.len() {
            let outcome = try_parse(&encoded[..cut]).unwrap();
            assert_eq!(outcome, ParseOutcome::NeedMore, "cut at {cut}");
        }
    }

    #[test]
    fn rfind_magic_finds_last_occurrence() {
        let a = encode(Command::Ping, FormatByte::protobuf(), b"", 1).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&a);
        assert_eq!(rfind_magic(&buf), Some(a.len()));
        assert_eq!(rfind_magic(b"\x00\x01\x02"), None);
    }
}
