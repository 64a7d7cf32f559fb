// Extraction of a high-level request out of a raw RRQ/WRQ packet.
//
// The parser is deliberately lenient: it does not look at byte 0 and accepts any mode string.
// Structural conformance is the job of validate::verify_request, which the listener runs first.
// A packet the parser cannot make sense of yields None and is simply dropped by the caller.

use crate::tftp::OpCode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Read,
    Write,
    Test,
}

/// A request to read or write a file, as sent by the peer that opened the transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub operation: Operation,
    file_path: String,
    pub mode: String,
}

impl Request {
    pub fn new(operation: Operation, file_path: impl Into<String>, mode: impl Into<String>) -> Request {
        Request {
            operation,
            file_path: file_path.into(),
            mode: mode.into(),
        }
    }

    /// The path exactly as the peer sent it.
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// The last component of the requested path.
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(['/', '\\'])
            .find(|s| !s.is_empty())
            .unwrap_or(&self.file_path)
    }
}

/// Scans for the 0 byte terminating the string that starts at `start`.
///
/// Returns the trimmed string and the index of its terminator, or None if the buffer ends first.
fn terminated_string(buf: &[u8], start: usize) -> Option<(String, usize)> {
    let rest = buf.get(start..).filter(|rest| !rest.is_empty())?;
    let len = rest.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&rest[..len]).trim().to_string();
    Some((s, start + len))
}

/// Extracts the operation, file path and mode from a request packet.
pub fn parse_request(buf: &[u8]) -> Option<Request> {
    let operation = match buf.get(1).copied().and_then(OpCode::from_byte) {
        Some(OpCode::Rrq) => Operation::Read,
        Some(OpCode::Wrq) => Operation::Write,
        _ => return None,
    };

    let (file_path, path_end) = terminated_string(buf, 2)?;
    let (mode, _) = terminated_string(buf, path_end + 1)?;

    Some(Request { operation, file_path, mode })
}
