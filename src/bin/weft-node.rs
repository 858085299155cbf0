//! weft node
//!
//! Runs a tunnel node that links up with its configured peers, serves
//! an echo listener on a channel and can dial a remote channel once.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};
use weft::{config::Config, DialOptions, ListenOptions, Message, Tunnel, TunnelOptions};

/// weft node - peer-to-peer overlay tunnel
#[derive(Parser, Debug)]
#[command(name = "weft-node")]
#[command(about = "Peer-to-peer overlay tunnel node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    address: Option<String>,

    /// Peer node addresses (overrides config)
    #[arg(short, long)]
    node: Vec<String>,

    /// Channel to serve an echo listener on
    #[arg(long, default_value = "echo")]
    channel: String,

    /// Dial this channel once and send a probe message
    #[arg(long)]
    dial: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path).context("failed to load configuration")?,
        None => Config::default(),
    };

    let mut options = TunnelOptions::new()
        .with_address(args.address.unwrap_or(config.node.address))
        .with_nodes(if args.node.is_empty() {
            config.node.nodes
        } else {
            args.node
        });

    if !config.node.id.is_empty() {
        options = options.with_id(config.node.id);
    }
    if !config.node.token.is_empty() {
        options = options.with_token(config.node.token);
    }

    let tunnel = Tunnel::new(options);
    tunnel
        .connect()
        .await
        .context("failed to connect tunnel")?;

    info!("tunnel {} listening on {}", tunnel.id(), tunnel.address());

    // serve an echo listener on the configured channel
    let listener = tunnel
        .listen(&args.channel, ListenOptions::new())
        .await
        .context("failed to listen")?;

    info!("serving echo on channel {}", listener.channel());

    let echo = tokio::spawn(async move {
        loop {
            let session = match listener.accept().await {
                Ok(session) => session,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            };

            debug!("accepted session {} on {}", session.id(), session.channel());

            tokio::spawn(async move {
                while let Ok(msg) = session.recv().await {
                    if session.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    // optionally dial a remote channel once
    if let Some(channel) = args.dial {
        let session = tunnel
            .dial(&channel, DialOptions::new())
            .await
            .with_context(|| format!("failed to dial {}", channel))?;

        session
            .send(Message::from_body("ping"))
            .await
            .context("failed to send")?;
        let reply = session.recv().await.context("failed to receive")?;

        info!(
            "channel {} answered with {} bytes over link {}",
            channel,
            reply.body.len(),
            session.link()
        );

        session.close().await.ok();
    }

    echo.await.ok();
    tunnel.close().await.ok();

    Ok(())
}
