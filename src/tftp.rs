use crate::request::{self, Operation};
use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

pub const OP_CODE_SIZE: usize = 2;
pub const BLOCK_NUMBER_SIZE: usize = 2;
pub const HEADER_SIZE: usize = OP_CODE_SIZE + BLOCK_NUMBER_SIZE;

/// Largest payload a single DATA packet may carry. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;
pub const MAX_ERROR_CODE: u16 = 7;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
    InvalidPort(SocketAddr),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
            SocketError::InvalidPort(dst) => write!(f, "Destination port of {dst} is outside 1-65535"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type TftpResult<T> = Result<T, SocketError>;

/// A caller asked the codec for something the packet (or the arguments) cannot provide.
///
/// These indicate a bug in the caller rather than a network condition: received packets are
/// expected to go through [`crate::validate`] before any field is decoded.
#[derive(Debug, PartialEq)]
pub enum CodecError {
    /// The packet's op code does not carry the requested field.
    WrongOpCode { expected: &'static str, found: u8 },
    /// The packet ends before the requested field.
    Truncated(usize),
    BlockNumberOutOfRange(String),
    InvalidErrorCode(u16),
    /// Only read and write requests have a wire encoding.
    NotARequest(Operation),
    UnknownMode(String),
    /// A request field would contain the NUL byte used as its terminator.
    EmbeddedNul(&'static str),
}

impl error::Error for CodecError {}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::WrongOpCode { expected, found } => {
                write!(f, "Expected a {expected} packet, but the op code is {found}")
            }
            Self::Truncated(len) => write!(f, "Packet of {len} bytes is too short"),
            Self::BlockNumberOutOfRange(b) => write!(f, "Block number {b} is outside 0-65535"),
            Self::InvalidErrorCode(code) => write!(f, "Error code {code} is outside 0-{MAX_ERROR_CODE}"),
            Self::NotARequest(op) => write!(f, "{op:?} requests cannot be encoded"),
            Self::UnknownMode(mode) => write!(f, "Unknown file mode: '{mode}'"),
            Self::EmbeddedNul(field) => write!(f, "The {field} contains a 0 byte"),
        }
    }
}

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    /// Matches a mode string in any combination of case.
    pub fn parse(raw: &str) -> Option<FileMode> {
        if raw.eq_ignore_ascii_case("netascii") {
            Some(FileMode::NetAscii)
        } else if raw.eq_ignore_ascii_case("octet") {
            Some(FileMode::Octet)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet. Code 6 is not used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    NoSuchUser,
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Option<ErrorCode> {
        match code {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::Illegal),
            5 => Some(ErrorCode::UnknownTid),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

impl OpCode {
    pub fn from_byte(b: u8) -> Option<OpCode> {
        match b {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Rrq => "Read",
            OpCode::Wrq => "Write",
            OpCode::Data => "Data",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Serializes the packet into its wire layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                put_request(self.op_code(), path.as_bytes(), mode.as_str().as_bytes())
            }
            Packet::Data { block, data } => put_block(OpCode::Data, *block, data),
            Packet::Ack { block } => put_block(OpCode::Ack, *block, &[]),
            Packet::Error { code, message } => put_error(u16::from(*code), message),
        }
    }

    /// Builds a typed view of a raw packet. Unknown error codes are reported as `Undefined`.
    pub fn parse(buf: &[u8]) -> Result<Packet, CodecError> {
        let op = decode_op_code(buf)?;
        match OpCode::from_byte(op) {
            Some(OpCode::Rrq) | Some(OpCode::Wrq) => {
                let req = request::parse_request(buf).ok_or(CodecError::Truncated(buf.len()))?;
                let mode = FileMode::parse(&req.mode).ok_or_else(|| CodecError::UnknownMode(req.mode.clone()))?;
                let path = req.file_path().to_string();
                Ok(match req.operation {
                    Operation::Read => Packet::ReadReq { path, mode },
                    _ => Packet::WriteReq { path, mode },
                })
            }
            Some(OpCode::Data) => Ok(Packet::Data {
                block: decode_block_number(buf)?,
                data: decode_data(buf)?.to_vec(),
            }),
            Some(OpCode::Ack) => Ok(Packet::Ack { block: decode_block_number(buf)? }),
            Some(OpCode::Error) => Ok(Packet::Error {
                code: ErrorCode::from_code(decode_error_code(buf)?).unwrap_or(ErrorCode::Undefined),
                message: decode_error_message(buf)?,
            }),
            None => Err(CodecError::WrongOpCode { expected: "TFTP", found: op }),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.op_code().name();
        match self {
            Packet::ReadReq { path, .. } | Packet::WriteReq { path, .. } => {
                write!(f, "{name} Request packet for file: {path}")
            }
            Packet::Data { block, data } => write!(f, "{name} packet for block#: {block} ({} bytes)", data.len()),
            Packet::Ack { block } => write!(f, "{name} packet for block#: {block}"),
            Packet::Error { code, message } => write!(f, "{name} packet ({code:?}) with message: {message}"),
        }
    }
}

/// One-line description of a raw packet for logging. Never fails.
pub fn describe(buf: &[u8]) -> String {
    match Packet::parse(buf) {
        Ok(packet) => packet.to_string(),
        Err(_) => format!("Malformed packet of {} bytes", buf.len()),
    }
}

///////////////////////////////////////////////////////////////
// Encoding

fn put_request(op: OpCode, path: &[u8], mode: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OP_CODE_SIZE + path.len() + mode.len() + 2);
    buf.extend_from_slice(&[0, op.as_byte()]);
    buf.extend_from_slice(path);
    buf.push(0);
    buf.extend_from_slice(mode);
    buf.push(0);
    buf
}

fn put_block(op: OpCode, block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&[0, op.as_byte()]);
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn put_error(code: u16, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + message.len() + 1);
    buf.extend_from_slice(&[0, OpCode::Error.as_byte()]);
    buf.extend_from_slice(&code.to_be_bytes());
    // The message is 0-terminated, so it cannot carry a 0 byte of its own.
    buf.extend(message.bytes().filter(|&b| b != 0));
    buf.push(0);
    buf
}

fn block_number<B>(block: B) -> Result<u16, CodecError>
where
    B: TryInto<u16> + fmt::Display + Copy,
{
    block
        .try_into()
        .map_err(|_| CodecError::BlockNumberOutOfRange(block.to_string()))
}

/// Builds a RRQ or WRQ packet: `0 | op | file name | 0 | mode | 0`.
pub fn encode_request(op: Operation, file_name: &str, mode: &str) -> Result<Vec<u8>, CodecError> {
    let op = match op {
        Operation::Read => OpCode::Rrq,
        Operation::Write => OpCode::Wrq,
        Operation::Test => return Err(CodecError::NotARequest(op)),
    };
    if file_name.contains('\0') {
        return Err(CodecError::EmbeddedNul("file name"));
    }
    if mode.contains('\0') {
        return Err(CodecError::EmbeddedNul("mode"));
    }
    Ok(put_request(op, file_name.as_bytes(), mode.as_bytes()))
}

/// Builds a DATA packet. The payload length is the caller's business; anything up to
/// [`DATA_BUFFER_SIZE`] is legal on the wire.
pub fn encode_data<B>(block: B, payload: &[u8]) -> Result<Vec<u8>, CodecError>
where
    B: TryInto<u16> + fmt::Display + Copy,
{
    Ok(put_block(OpCode::Data, block_number(block)?, payload))
}

pub fn encode_ack<B>(block: B) -> Result<Vec<u8>, CodecError>
where
    B: TryInto<u16> + fmt::Display + Copy,
{
    Ok(put_block(OpCode::Ack, block_number(block)?, &[]))
}

pub fn encode_error(code: ErrorCode, message: &str) -> Vec<u8> {
    put_error(u16::from(code), message)
}

///////////////////////////////////////////////////////////////
// Decoding

fn u16_from_buffer(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    match buf.get(offset..offset + 2) {
        Some(&[hi, lo]) => Ok(u16::from_be_bytes([hi, lo])),
        _ => Err(CodecError::Truncated(buf.len())),
    }
}

/// Returns the op code byte. Only the low byte is significant for the five known packets.
pub fn decode_op_code(buf: &[u8]) -> Result<u8, CodecError> {
    match buf.get(..OP_CODE_SIZE) {
        Some(&[_, op]) => Ok(op),
        _ => Err(CodecError::Truncated(buf.len())),
    }
}

fn expect_op_code(buf: &[u8], wanted: &[OpCode], expected: &'static str) -> Result<(), CodecError> {
    let found = decode_op_code(buf)?;
    if wanted.iter().any(|op| op.as_byte() == found) {
        Ok(())
    } else {
        Err(CodecError::WrongOpCode { expected, found })
    }
}

/// Block number of a DATA or ACK packet.
pub fn decode_block_number(buf: &[u8]) -> Result<u16, CodecError> {
    expect_op_code(buf, &[OpCode::Data, OpCode::Ack], "DATA or ACK")?;
    u16_from_buffer(buf, OP_CODE_SIZE)
}

/// Payload of a DATA packet, everything after the 4 byte header.
pub fn decode_data(buf: &[u8]) -> Result<&[u8], CodecError> {
    expect_op_code(buf, &[OpCode::Data], "DATA")?;
    buf.get(HEADER_SIZE..).ok_or(CodecError::Truncated(buf.len()))
}

pub fn decode_error_code(buf: &[u8]) -> Result<u16, CodecError> {
    expect_op_code(buf, &[OpCode::Error], "ERROR")?;
    let code = u16_from_buffer(buf, OP_CODE_SIZE)?;
    if code > MAX_ERROR_CODE {
        return Err(CodecError::InvalidErrorCode(code));
    }
    Ok(code)
}

/// Message of an ERROR packet, up to the terminating 0 byte (or the end of the packet).
pub fn decode_error_message(buf: &[u8]) -> Result<String, CodecError> {
    expect_op_code(buf, &[OpCode::Error], "ERROR")?;
    let raw = buf.get(HEADER_SIZE..).ok_or(CodecError::Truncated(buf.len()))?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

///////////////////////////////////////////////////////////////
// Outbound DATA sequences

/// Splits `bytes` into the DATA packets that would carry it, starting at block 1.
///
/// Block numbers wrap from 65535 to 0. When the length is a multiple of 512 (including an empty
/// source) a trailing zero-length packet marks the end of the transfer.
pub fn data_packets(bytes: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::with_capacity(bytes.len() / DATA_BUFFER_SIZE + 1);
    let mut block: u16 = 1;
    for chunk in bytes.chunks(DATA_BUFFER_SIZE) {
        packets.push(Packet::Data { block, data: chunk.to_vec() });
        block = block.wrapping_add(1);
    }
    if bytes.len() % DATA_BUFFER_SIZE == 0 {
        packets.push(Packet::Data { block, data: vec![] });
    }
    packets
}

/// Reads a whole file and splits it the way [`data_packets`] does.
pub async fn data_packets_from_file(path: &Path) -> Result<Vec<Packet>, io::Error> {
    let mut f = tokio::fs::File::open(path).await?;
    let mut contents = Vec::new();
    f.read_to_end(&mut contents).await?;
    Ok(data_packets(&contents))
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that exchanges raw TFTP datagrams.
///
/// Received datagrams are returned as-is; structural checks live in [`crate::validate`].
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits up to `ttl` for one datagram, truncated to its received length.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        // One byte more than the largest legal packet, so oversized packets are still detectable.
        let mut buf = vec![0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        buf.truncate(total_written);
        Ok((buf, src))
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_raw(&packet.encode(), dst).await
    }

    pub async fn send_raw(&self, buf: &[u8], dst: SocketAddr) -> TftpResult<()> {
        if dst.port() == 0 {
            return Err(SocketError::InvalidPort(dst));
        }
        self.sock.send_to(buf, dst).await?;
        Ok(())
    }
}
