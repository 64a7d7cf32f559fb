// Structural checks for incoming packets.
//
// Every check walks the packet with a Cursor whose reads fail closed: running off the end of the
// buffer is reported as a ValidationError like any other defect, so a truncated or garbage
// datagram can never take a handler down. The Display text of each error is the reason sent back
// to the peer in ERROR packets.

use crate::tftp::{FileMode, OpCode, MAX_ERROR_CODE, MAX_PACKET_SIZE};
use std::error;
use std::fmt;

/// Why a packet failed validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationError {
    TooLarge,
    TooSmall,
    FirstByteNotZero,
    InvalidOpCode,
    MissingFileName,
    InvalidMode,
    MissingFinalZero,
    MissingErrorCodeSeparator,
    InvalidErrorCode,
    TrailingBytes,
    InvalidBlockNumber,
    /// A read went past the end of the packet.
    Malformed,
}

impl error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self {
            Self::TooLarge => "Packet too large",
            Self::TooSmall => "Packet too small",
            Self::FirstByteNotZero => "First byte is not 0",
            Self::InvalidOpCode => "Invalid op code",
            Self::MissingFileName => "Missing file name",
            Self::InvalidMode => "Invalid mode",
            Self::MissingFinalZero => "Missing final 0 byte",
            Self::MissingErrorCodeSeparator => "Missing 0 byte separating op code and error code",
            Self::InvalidErrorCode => "Invalid error code",
            Self::TrailingBytes => "No termination after final 0 byte",
            Self::InvalidBlockNumber => "Invalid block number",
            Self::Malformed => "Something is wrong with the packet",
        };
        f.write_str(reason)
    }
}

pub type Validation = Result<(), ValidationError>;

/// Bounds-checked read position over a packet.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<u8, ValidationError> {
        let b = *self.buf.get(self.pos).ok_or(ValidationError::Malformed)?;
        self.pos += 1;
        Ok(b)
    }

    /// Consumes one byte, failing with `err` unless it satisfies `pred`.
    fn expect(&mut self, pred: impl FnOnce(u8) -> bool, err: ValidationError) -> Validation {
        if pred(self.next()?) {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn next_u16(&mut self) -> Result<u16, ValidationError> {
        let hi = self.next()?;
        let lo = self.next()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Consumes a 0-terminated span, terminator included, and returns the bytes before it.
    /// Fails with `unterminated` if the packet ends first.
    fn terminated(&mut self, unterminated: ValidationError) -> Result<&'a [u8], ValidationError> {
        let rest = self.buf.get(self.pos..).ok_or(unterminated)?;
        let len = rest.iter().position(|&b| b == 0).ok_or(unterminated)?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn finish(&self) -> Validation {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ValidationError::TrailingBytes)
        }
    }
}

fn is_op(op: OpCode) -> impl FnOnce(u8) -> bool {
    move |b| b == op.as_byte()
}

/// Checks a RRQ/WRQ: `0 | 1 or 2 | file name | 0 | "netascii" or "octet" | 0`, nothing after.
pub fn verify_request(buf: &[u8]) -> Validation {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(ValidationError::TooLarge);
    }
    let mut cur = Cursor::new(buf);
    cur.expect(|b| b == 0, ValidationError::FirstByteNotZero)?;
    cur.expect(
        |b| b == OpCode::Rrq.as_byte() || b == OpCode::Wrq.as_byte(),
        ValidationError::InvalidOpCode,
    )?;

    if cur.terminated(ValidationError::Malformed)?.is_empty() {
        return Err(ValidationError::MissingFileName);
    }

    let mode = cur.terminated(ValidationError::MissingFinalZero)?;
    let valid_mode = std::str::from_utf8(mode).ok().and_then(FileMode::parse).is_some();
    if !valid_mode {
        return Err(ValidationError::InvalidMode);
    }

    cur.finish()
}

/// Checks a DATA packet whose block number must not be ahead of `expected`.
///
/// Blocks behind `expected` pass, since they are retransmissions the receiver re-acknowledges.
pub fn verify_data(buf: &[u8], expected: u16) -> Validation {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(ValidationError::TooLarge);
    }
    let mut cur = Cursor::new(buf);
    cur.expect(|b| b == 0, ValidationError::FirstByteNotZero)?;
    cur.expect(is_op(OpCode::Data), ValidationError::InvalidOpCode)?;
    if cur.next_u16()? > expected {
        return Err(ValidationError::InvalidBlockNumber);
    }
    Ok(())
}

/// Checks an ACK packet, which is exactly 4 bytes long.
pub fn verify_ack(buf: &[u8], expected: u16) -> Validation {
    if buf.len() > 4 {
        return Err(ValidationError::TooLarge);
    }
    if buf.len() < 4 {
        return Err(ValidationError::TooSmall);
    }
    let mut cur = Cursor::new(buf);
    cur.expect(|b| b == 0, ValidationError::FirstByteNotZero)?;
    cur.expect(is_op(OpCode::Ack), ValidationError::InvalidOpCode)?;
    if cur.next_u16()? > expected {
        return Err(ValidationError::InvalidBlockNumber);
    }
    Ok(())
}

/// Checks an ERROR packet: `0 | 5 | 0 | code 0-7 | message | 0`, nothing after.
pub fn verify_error(buf: &[u8]) -> Validation {
    let mut cur = Cursor::new(buf);
    cur.expect(|b| b == 0, ValidationError::FirstByteNotZero)?;
    cur.expect(is_op(OpCode::Error), ValidationError::InvalidOpCode)?;
    cur.expect(|b| b == 0, ValidationError::MissingErrorCodeSeparator)?;
    cur.expect(|b| u16::from(b) <= MAX_ERROR_CODE, ValidationError::InvalidErrorCode)?;
    cur.terminated(ValidationError::MissingFinalZero)?;
    cur.finish()
}

/// True iff the DATA or ACK packet carries exactly the `expected` block number.
pub fn check_in_order(buf: &[u8], expected: u16) -> bool {
    match buf.get(..4) {
        Some(&[0, op, hi, lo]) if op == OpCode::Data.as_byte() || op == OpCode::Ack.as_byte() => {
            u16::from_be_bytes([hi, lo]) == expected
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Operation;
    use crate::tftp::{encode_ack, encode_data, encode_error, encode_request, ErrorCode};

    fn wrq(path: &str, mode: &str) -> Vec<u8> {
        encode_request(Operation::Write, path, mode).unwrap()
    }

    #[test]
    fn test_request_accepts_both_modes_in_any_case() {
        for mode in ["octet", "OCTET", "netascii", "NetASCII"] {
            assert_eq!(verify_request(&wrq("pic.jpg", mode)), Ok(()));
        }
        let rrq = encode_request(Operation::Read, "pic.jpg", "octet").unwrap();
        assert_eq!(verify_request(&rrq), Ok(()));
    }

    #[test]
    fn test_request_rejections() {
        assert_eq!(verify_request(&wrq("pic.jpg", "mail")), Err(ValidationError::InvalidMode));
        assert_eq!(verify_request(&wrq("pic.jpg", "octets")), Err(ValidationError::InvalidMode));
        assert_eq!(verify_request(&wrq("pic.jpg", "octe")), Err(ValidationError::InvalidMode));
        assert_eq!(verify_request(&wrq("", "octet")), Err(ValidationError::MissingFileName));

        let mut trailing = wrq("pic.jpg", "octet");
        trailing.push(0x41);
        assert_eq!(verify_request(&trailing), Err(ValidationError::TrailingBytes));

        let mut unterminated = wrq("pic.jpg", "octet");
        unterminated.pop();
        assert_eq!(verify_request(&unterminated), Err(ValidationError::MissingFinalZero));

        assert_eq!(verify_request(&[0x01, 0x02, 0x61, 0x00]), Err(ValidationError::FirstByteNotZero));
        assert_eq!(verify_request(&[0x00, 0x03, 0x61, 0x00]), Err(ValidationError::InvalidOpCode));
        assert_eq!(verify_request(&[0x00, 0x02, 0x61, 0x62]), Err(ValidationError::Malformed));
        assert_eq!(verify_request(&[0x00]), Err(ValidationError::Malformed));
        assert_eq!(verify_request(&[]), Err(ValidationError::Malformed));

        let huge = wrq(&"x".repeat(510), "octet");
        assert_eq!(verify_request(&huge), Err(ValidationError::TooLarge));
    }

    #[test]
    fn test_data_block_window() {
        let expected = 10;
        assert_eq!(verify_data(&encode_data(10u16, &[1]).unwrap(), expected), Ok(()));
        assert_eq!(verify_data(&encode_data(9u16, &[1]).unwrap(), expected), Ok(()));
        assert_eq!(verify_data(&encode_data(0u16, &[]).unwrap(), expected), Ok(()));
        assert_eq!(
            verify_data(&encode_data(11u16, &[1]).unwrap(), expected),
            Err(ValidationError::InvalidBlockNumber)
        );
        // After wrapping, the number a long way "behind" is numerically ahead.
        assert_eq!(
            verify_data(&encode_data(65535u16, &[1]).unwrap(), 0),
            Err(ValidationError::InvalidBlockNumber)
        );
    }

    #[test]
    fn test_data_structure() {
        assert_eq!(verify_data(&encode_data(1u16, &[0; 512]).unwrap(), 1), Ok(()));
        assert_eq!(verify_data(&encode_data(1u16, &[0; 513]).unwrap(), 1), Err(ValidationError::TooLarge));
        assert_eq!(verify_data(&[0x00, 0x03, 0x00], 1), Err(ValidationError::Malformed));
        assert_eq!(verify_data(&[0x00, 0x04, 0x00, 0x01], 1), Err(ValidationError::InvalidOpCode));
        assert_eq!(verify_data(&[0x05, 0x03, 0x00, 0x01], 1), Err(ValidationError::FirstByteNotZero));
        assert_eq!(verify_data(&encode_error(ErrorCode::DiskFull, "x"), 1), Err(ValidationError::InvalidOpCode));
    }

    #[test]
    fn test_ack_is_exactly_four_bytes() {
        assert_eq!(verify_ack(&encode_ack(3u16).unwrap(), 3), Ok(()));
        assert_eq!(verify_ack(&encode_ack(2u16).unwrap(), 3), Ok(()));
        assert_eq!(verify_ack(&encode_ack(4u16).unwrap(), 3), Err(ValidationError::InvalidBlockNumber));
        assert_eq!(verify_ack(&[0x00, 0x04, 0x00, 0x01, 0x00], 3), Err(ValidationError::TooLarge));
        assert_eq!(verify_ack(&[0x00, 0x04, 0x00], 3), Err(ValidationError::TooSmall));
        assert_eq!(verify_ack(&[0x00, 0x03, 0x00, 0x01], 3), Err(ValidationError::InvalidOpCode));
    }

    #[test]
    fn test_error_packets() {
        assert_eq!(verify_error(&encode_error(ErrorCode::Illegal, "cancelled")), Ok(()));
        assert_eq!(verify_error(&encode_error(ErrorCode::NoSuchUser, "")), Ok(()));
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0x06, 0x00]), Ok(()));
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0x08, 0x00]), Err(ValidationError::InvalidErrorCode));
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0xFF, 0x00]), Err(ValidationError::InvalidErrorCode));
        assert_eq!(
            verify_error(&[0x00, 0x05, 0x01, 0x01, 0x00]),
            Err(ValidationError::MissingErrorCodeSeparator)
        );
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0x01]), Err(ValidationError::MissingFinalZero));
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0x01, 0x61]), Err(ValidationError::MissingFinalZero));
        assert_eq!(verify_error(&[0x00, 0x05, 0x00, 0x01, 0x00, 0x00]), Err(ValidationError::TrailingBytes));
        assert_eq!(verify_error(&[0x00, 0x05]), Err(ValidationError::Malformed));
    }

    #[test]
    fn test_in_order_is_exact() {
        let n = 300u16;
        let data = |b: u16| encode_data(b, &[0xAA]).unwrap();
        assert!(check_in_order(&data(n), n));
        assert!(!check_in_order(&data(n - 1), n));
        assert!(!check_in_order(&data(n + 1), n));
        assert!(check_in_order(&encode_ack(n).unwrap(), n));
        assert!(check_in_order(&data(0), n.wrapping_add(65236)));
        assert!(!check_in_order(&encode_error(ErrorCode::Undefined, ""), 0));
        assert!(!check_in_order(&[0x00, 0x03, 0x01], 1));
    }

    #[test]
    fn test_reasons_read_like_sentences() {
        assert_eq!(ValidationError::Malformed.to_string(), "Something is wrong with the packet");
        assert_eq!(ValidationError::TrailingBytes.to_string(), "No termination after final 0 byte");
    }
}
