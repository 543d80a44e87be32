//! strand-host — entry point.
//!
//! ```text
//! strand-host                      Run with strand-host.toml (or defaults)
//! strand-host --config <path>      Load a custom config TOML
//! strand-host --listen 0.0.0.0:9000 --peer 10.0.0.2:9001
//! strand-host --gen-config         Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand_core::CaptureKind;
use strand_host::config::HostConfig;
use strand_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "strand-host", about = "Strand desktop streaming host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "strand-host.toml")]
    config: PathBuf,

    /// Override the UDP listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Only stream to this viewer address.
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Stream a generated test pattern instead of the display.
    #[arg(long)]
    synthetic: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }
    if cli.peer.is_some() {
        config.network.peer = cli.peer;
    }
    if cli.synthetic {
        config.capture.kind = CaptureKind::Synthetic;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("strand-host v{}", env!("CARGO_PKG_VERSION"));
    info!(
        capture = %config.capture.kind,
        codec = %config.encoder.codec,
        bitrate_kbps = config.encoder.bitrate_kbps,
        fps = config.encoder.fps,
        "configuration"
    );

    let service = HostService::bind(config).await?;
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    service.run().await?;
    Ok(())
}
