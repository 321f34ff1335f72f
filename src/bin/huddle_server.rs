//! Standalone relay server binary
//!
//! Run with:
//!   cargo run --bin huddle-server -- --port 5000
//!
//! Accept raw, untagged audio from older clients:
//!   cargo run --bin huddle-server -- --framing legacy

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use huddle::protocol::Framing;
use huddle::server::{RelayServer, ServerConfig};

/// Room-based voice relay server
#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(about = "Room-based voice relay server")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5000", env = "HUDDLE_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "HUDDLE_HOST")]
    host: String,

    /// Audio framing expected from clients (tagged or legacy)
    #[arg(long, default_value = "tagged", env = "HUDDLE_FRAMING")]
    framing: Framing,

    /// Bytes read per relayed chunk with legacy framing
    #[arg(long, default_value = "4096")]
    relay_chunk_size: usize,

    /// Frames queued per connection before a slow client starts losing audio
    #[arg(long, default_value = "64")]
    outbound_queue: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        framing: args.framing,
        relay_chunk_size: args.relay_chunk_size,
        outbound_queue: args.outbound_queue,
        ..Default::default()
    };

    let server = RelayServer::bind(config)
        .await
        .with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?;
    info!(
        "Relay server on {} ({} framing)",
        server.local_addr(),
        args.framing
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await?;
    info!("Relay server stopped");
    Ok(())
}
