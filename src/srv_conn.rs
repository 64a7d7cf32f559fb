// This module contains the server-side connection handler for write requests.
//
// A TransferSession is created when the listener accepts a WRQ. It works in roughly the following
// stages:
//
// 1. Bind a fresh socket on a random port. That port is the server's TID for this transfer, and
//    the client's source address and port are the client's TID.
// 2. Send ACK 0, then alternate between waiting for a DATA packet and acknowledging it. Every
//    protocol decision is made by processor::WriteProcessor; this module only moves datagrams.
// 3. Finish once the short final block has been acknowledged, handing the assembled bytes to the
//    context's image sink, or abort on timeout, on an ERROR from the peer, or on an illegal
//    packet.
//
// Datagrams arriving from anyone but the client are answered with an "unknown TID" ERROR and
// otherwise ignored; they never affect the transfer.

use crate::processor::{AbortReason, ResultAction, TransferState, WriteProcessor};
use crate::request::{Operation, Request};
use crate::server::ServerContext;
use crate::sink::ReceivedImage;
use crate::tftp::{self, SocketError, TftpSocket};
use rand::Rng;
use std::error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;

const BIND_ATTEMPTS: usize = 16;

/// How a transfer session ended.
#[derive(Debug, PartialEq)]
pub enum TransferOutcome {
    /// The upload finished and this many bytes were handed to the sink.
    Completed(usize),
    Aborted(AbortReason),
}

/// An object responsible for handling one write request.
pub struct TransferSession {
    /// The TFTP socket used to send and receive packets for this transfer only.
    sock: TftpSocket,

    /// The peer's address and TID.
    dst: SocketAddr,

    request: Request,

    /// The packet processor.
    processor: WriteProcessor,

    ctx: Arc<ServerContext>,
}

/// Attempts to bind to a random UDP port in `ports` until one succeeds.
fn bind_random_socket(ip: IpAddr, ports: &Range<u16>) -> Result<TftpSocket, ServerConnectionError> {
    if ports.is_empty() {
        return Err(ServerConnectionError::Internal(format!("Empty port range {ports:?}")));
    }
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(ports.clone());
        match TftpSocket::bind((ip, port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket to port {port}: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => ServerConnectionError::Socket(e),
        None => ServerConnectionError::Internal("No bind attempt was made".to_string()),
    })
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: tftp::ErrorCode, message: String) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&tftp::Packet::Error { code, message }, dst).await;
}

impl TransferSession {
    pub fn new(
        ctx: Arc<ServerContext>,
        request: Request,
        src: SocketAddr,
    ) -> Result<TransferSession, ServerConnectionError> {
        if request.operation != Operation::Write {
            return Err(ServerConnectionError::BadRequest(format!(
                "Only write requests start a transfer, got {:?}",
                request.operation
            )));
        }

        let sock = bind_random_socket(ctx.config.session_ip(), &ctx.config.port_range)?;
        log::debug!("Bound {} for {} from {src}", sock.local_addr()?, request.file_path());

        let processor = WriteProcessor::new(&request);
        Ok(TransferSession { sock, dst: src, request, processor, ctx })
    }

    /// The server's side of the transfer.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerConnectionError> {
        Ok(self.sock.local_addr()?)
    }

    /// Waits for the next datagram, giving up after the configured number of timeouts.
    async fn recv(&self) -> Result<Option<(Vec<u8>, SocketAddr)>, SocketError> {
        let config = &self.ctx.config;
        for attempt in 0..=config.max_retries {
            match self.sock.recv_with_timeout(config.transfer_timeout).await {
                Ok(received) => return Ok(Some(received)),
                Err(SocketError::Timeout(_)) => {
                    log::debug!("Timed out waiting for {} (attempt {})", self.dst, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn aborted(&self) -> Result<TransferOutcome, ServerConnectionError> {
        match self.processor.state() {
            TransferState::Aborted(reason) => Ok(TransferOutcome::Aborted(reason.clone())),
            state => Err(ServerConnectionError::Internal(format!("Connection closed in state {state:?}"))),
        }
    }

    fn complete(self) -> Result<TransferOutcome, ServerConnectionError> {
        let file_name = self.request.file_name().to_string();
        let bytes = self.processor.into_bytes().ok_or_else(|| {
            ServerConnectionError::Internal("Transfer finished without completing".to_string())
        })?;
        let len = bytes.len();
        log::info!("Received {file_name} ({len} bytes) from {}", self.dst);
        self.ctx.sink.deliver(ReceivedImage { file_name, peer: self.dst, bytes });
        Ok(TransferOutcome::Completed(len))
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(mut self) -> Result<TransferOutcome, ServerConnectionError> {
        let first = self.processor.first_packet();
        log::debug!("Sending {first} to {}", self.dst);
        self.sock.send(&first, self.dst).await?;

        loop {
            let Some((packet, src)) = self.recv().await? else {
                log::warn!(
                    "No response from {} after {} attempts, abandoning {}",
                    self.dst,
                    self.ctx.config.max_retries + 1,
                    self.request.file_path()
                );
                self.processor.time_out();
                return self.aborted();
            };

            // First, check whether the data came from the src we were expecting.
            if src != self.dst {
                log::warn!("Got a packet for the transfer with {} from {src}", self.dst);
                send_error_packet(
                    &self.sock,
                    src,
                    tftp::ErrorCode::UnknownTid,
                    "The address and port of the packet does not match the TID of the ongoing transfer.".to_string(),
                )
                .await;
                // Continue waiting for a good packet from the expected peer.
                continue;
            }

            log::trace!("Got {} from {src}", tftp::describe(&packet));

            // Next, figure out how to respond.
            let action = self.processor.process_packet(&packet).map_err(|e| {
                log::error!("Packet from {src} passed validation but could not be decoded: {e}");
                ServerConnectionError::Internal(e.to_string())
            })?;

            match action {
                ResultAction::SendPacketAndAwait(p) => {
                    log::debug!("Sending {p} to {}", self.dst);
                    self.sock.send(&p, self.dst).await?;
                }
                ResultAction::CloseConnection(maybe_warn) => {
                    if let Some(msg) = maybe_warn {
                        log::warn!("{}", msg);
                    }
                    log::info!("Closing connection with {}", self.dst);
                    return self.aborted();
                }
                ResultAction::TerminateWithPacket(p) => {
                    log::warn!("Terminating transfer with {}: {p}", self.dst);
                    let _ = self.sock.send(&p, self.dst).await;
                    return self.aborted();
                }
                ResultAction::Finish(p) => {
                    log::debug!("Sending final {p} to {}", self.dst);
                    self.sock.send(&p, self.dst).await?;
                    return self.complete();
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    Socket(SocketError),
    Internal(String),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {:#?}", msg),
            Self::Socket(e) => write!(f, "{e}"),
            Self::Internal(msg) => write!(f, "Internal error: {:#?}", msg),
        }
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
