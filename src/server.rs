// The listener accepting new transfers on the well-known port.

use crate::request::{self, Operation, Request};
use crate::sink::ImageSink;
use crate::srv_conn::{TransferOutcome, TransferSession};
use crate::tftp::{self, ErrorCode, SocketError, TftpSocket};
use crate::validate;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

pub const DEFAULT_PORT: u16 = 69;

/// Server options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where requests are accepted. Sessions bind on the same IP.
    pub bind_address: SocketAddr,

    /// How long the accept loop blocks before checking for shutdown.
    pub idle_timeout: Duration,

    /// How long a session waits for each packet from its peer.
    pub transfer_timeout: Duration,

    /// How many more times a session waits after its first timeout before giving up.
    pub max_retries: u32,

    /// Upper bound on concurrently running sessions.
    pub max_connections: usize,

    /// Ports sessions pick their TID from.
    pub port_range: Range<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            idle_timeout: Duration::from_millis(5000),
            transfer_timeout: Duration::from_millis(2000),
            max_retries: 3,
            max_connections: 32,
            port_range: 1024..65535,
        }
    }
}

impl ServerConfig {
    pub fn session_ip(&self) -> IpAddr {
        self.bind_address.ip()
    }
}

/// Everything the listener and its sessions share. Built once and passed around in an `Arc`.
pub struct ServerContext {
    pub config: ServerConfig,
    pub sink: Arc<dyn ImageSink>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, sink: Arc<dyn ImageSink>) -> Arc<ServerContext> {
        Arc::new(ServerContext { config, sink })
    }
}

/// Accepts requests and starts one [`TransferSession`] per accepted write request.
pub struct Listener {
    sock: TftpSocket,
    ctx: Arc<ServerContext>,
    permits: Arc<Semaphore>,
}

impl Listener {
    pub fn bind(ctx: Arc<ServerContext>) -> Result<Listener, SocketError> {
        let sock = TftpSocket::bind(ctx.config.bind_address)?;
        let permits = Arc::new(Semaphore::new(ctx.config.max_connections));
        Ok(Listener { sock, ctx, permits })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Serves requests until `shutdown` holds `true`. Sessions already started keep running.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), SocketError> {
        log::info!("Listening for requests on {}", self.local_addr()?);
        while !*shutdown.borrow() {
            match self.sock.recv_with_timeout(self.ctx.config.idle_timeout).await {
                Ok((packet, src)) => self.dispatch(&packet, src).await,
                Err(SocketError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        log::info!("Listener on {} shutting down", self.local_addr()?);
        Ok(())
    }

    async fn reply_error(&self, dst: SocketAddr, code: ErrorCode, message: String) {
        if let Err(e) = self.sock.send(&tftp::Packet::Error { code, message }, dst).await {
            log::warn!("Unable to send error packet to {dst}: {e}");
        }
    }

    async fn dispatch(&self, packet: &[u8], src: SocketAddr) {
        log::trace!("Got {} from {src}", tftp::describe(packet));

        if let Err(reason) = validate::verify_request(packet) {
            log::warn!("Rejecting malformed request from {src}: {reason}");
            self.reply_error(src, ErrorCode::Illegal, reason.to_string()).await;
            return;
        }

        let Some(request) = request::parse_request(packet) else {
            log::warn!("Dropping request from {src} that could not be parsed");
            return;
        };

        match request.operation {
            Operation::Write => self.start_session(request, src).await,
            op => log::info!("Ignoring {op:?} request for {} from {src}", request.file_path()),
        }
    }

    async fn start_session(&self, request: Request, src: SocketAddr) {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            log::warn!("Refusing {} from {src}: {} transfers running", request.file_path(), self.ctx.config.max_connections);
            self.reply_error(src, ErrorCode::Undefined, "Server busy, try again later".to_string()).await;
            return;
        };

        log::info!("Accepted write of {} ({}) from {src}", request.file_path(), request.mode);
        let file_path = request.file_path().to_string();
        let session = match TransferSession::new(Arc::clone(&self.ctx), request, src) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Unable to start transfer of {file_path} from {src}: {e}");
                self.reply_error(src, ErrorCode::Undefined, "Internal error, please retry".to_string()).await;
                return;
            }
        };

        tokio::spawn(async move {
            let _permit = permit;
            match session.handle().await {
                Ok(TransferOutcome::Completed(_)) => {}
                Ok(TransferOutcome::Aborted(reason)) => {
                    log::warn!("Transfer of {file_path} from {src} aborted: {reason:?}");
                }
                Err(e) => log::error!("Transfer of {file_path} from {src} failed: {e}"),
            }
        });
    }
}
