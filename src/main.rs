use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use monitor_tftpd::{Listener, ReceivedImage, ServerConfig, ServerContext};
use tokio::sync::{mpsc, watch};

const DEFAULT_BIND: &str = "0.0.0.0:69";

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server receiving image uploads",
    example = "Serve on an unprivileged port:\n  {command_name} --bind 0.0.0.0:6969"
)]
struct CliConfig {
    #[argh(
        option,
        short = 'b',
        description = "address to accept requests on",
        default = "DEFAULT_BIND.to_string()"
    )]
    bind: String,

    #[argh(option, description = "milliseconds to wait for each packet of a transfer", default = "2000")]
    timeout_ms: u64,

    #[argh(option, description = "additional waits before a silent transfer is abandoned", default = "3")]
    retries: u32,

    #[argh(option, description = "maximum number of simultaneous transfers", default = "32")]
    max_connections: usize,

    #[argh(option, description = "milliseconds the accept loop blocks between shutdown checks", default = "5000")]
    idle_timeout_ms: u64,
}

impl CliConfig {
    fn into_server_config(self) -> Result<ServerConfig> {
        let bind_address: SocketAddr = self
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", self.bind))?;
        Ok(ServerConfig {
            bind_address,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            transfer_timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.retries,
            max_connections: self.max_connections,
            ..ServerConfig::default()
        })
    }
}

/// Stand-in for the image consumer: reports every upload as it arrives.
async fn consume_images(mut images: mpsc::UnboundedReceiver<ReceivedImage>) {
    let mut count = 0usize;
    while let Some(image) = images.recv().await {
        count += 1;
        log::info!(
            "Image #{count}: {} ({} bytes) from {}",
            image.file_name,
            image.bytes.len(),
            image.peer
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = argh::from_env::<CliConfig>().into_server_config()?;
    let bind_address = config.bind_address;

    let (image_tx, image_rx) = mpsc::unbounded_channel();
    let ctx = ServerContext::new(config, Arc::new(image_tx));
    let listener = Listener::bind(ctx).with_context(|| format!("Couldn't bind {bind_address}"))?;

    let consumer = tokio::spawn(consume_images(image_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, stopping listener");
            let _ = shutdown_tx.send(true);
        }
    });

    listener.run(shutdown_rx).await.context("Listener failed")?;

    // Sessions still running hold their own sender; the consumer ends once they finish.
    drop(listener);
    consumer.await.context("Image consumer panicked")?;
    Ok(())
}
