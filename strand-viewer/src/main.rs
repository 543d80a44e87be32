//! Strand viewer — entry point.
//!
//! ```text
//! strand-viewer                      Connect with defaults
//! strand-viewer --host <addr>        Override the host address
//! strand-viewer --headless           No window, no input forwarding
//! strand-viewer --stats-json         Print stats snapshots as JSON lines
//! strand-viewer --gen-config         Dump default config and exit
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::{ConnectionState, StreamError, Viewer, ViewerCallbacks, ViewerConfig, ViewerStats};

use strand_viewer::config::ViewerAppConfig;
use strand_viewer::connect::{self, Established};
use strand_viewer::input::InputMapper;
use strand_viewer::window::{NativeWindow, WindowEvent};

/// Window pump period.
const UI_TICK: Duration = Duration::from_millis(8);

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "strand-viewer", about = "Strand stream viewer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "strand-viewer.toml")]
    config: PathBuf,

    /// Host address (overrides config). Example: 192.168.1.100:9000
    #[arg(long)]
    host: Option<String>,

    /// Run without a window.
    #[arg(long)]
    headless: bool,

    /// Print stats snapshots to stdout as JSON lines.
    #[arg(long)]
    stats_json: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

/// Engine callbacks, forwarded to the main task.
enum AppEvent {
    ReconnectNeeded(u32),
    StateChange(ConnectionState),
    Stats(ViewerStats),
    Disconnected,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&ViewerAppConfig::default())?);
        return Ok(());
    }

    let mut config = ViewerAppConfig::load(&cli.config);
    if let Some(addr) = cli.host {
        config.network.host_address = addr.parse()?;
    }
    config.display.headless |= cli.headless;
    config.stats_json |= cli.stats_json;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("strand-viewer v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Window ───────────────────────────────────────────────

    let window = if config.display.headless {
        None
    } else {
        Some(NativeWindow::create("Strand", config.display.width, config.display.height)?)
    };

    // ── 2. Negotiate the first path ─────────────────────────────

    let Established { peer, result } = establish_blocking(&config).await?;
    let remote = result.remote.ok_or_else(|| StreamError::Peer("no remote address".into()))?;
    info!(%remote, kind = %result.connection_type, "connected to host");

    // ── 3. Start the engine ─────────────────────────────────────

    let (tx, mut events) = mpsc::unbounded_channel();
    let callbacks = {
        let (t1, t2, t3, t4) = (tx.clone(), tx.clone(), tx.clone(), tx);
        ViewerCallbacks::new()
            .on_reconnect_needed(move |attempt| {
                let _ = t1.send(AppEvent::ReconnectNeeded(attempt));
            })
            .on_state_change(move |state| {
                let _ = t2.send(AppEvent::StateChange(state));
            })
            .on_stats(move |stats| {
                let _ = t3.send(AppEvent::Stats(stats.clone()));
            })
            .on_disconnected(move || {
                let _ = t4.send(AppEvent::Disconnected);
            })
    };

    let session = config.session_for(remote);
    let mut mapper = InputMapper::new(config.display.width, config.display.height, session.width, session.height);
    let mut viewer = Viewer::new(
        ViewerConfig {
            session,
            socket: peer.into_socket(),
            surface: window.as_ref().map(NativeWindow::surface),
        },
        callbacks,
    )?;
    viewer.set_connection_type(result.connection_type);
    viewer.start()?;

    // ── 4. Event loop ───────────────────────────────────────────

    let mut tick = tokio::time::interval(UI_TICK);
    let mut pending: Option<JoinHandle<Result<Established, StreamError>>> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            Some(event) = events.recv() => match event {
                AppEvent::ReconnectNeeded(attempt) => {
                    if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                        continue;
                    }
                    info!(attempt, "negotiating a new path");
                    let cfg = config.clone();
                    pending = Some(tokio::task::spawn_blocking(move || connect::establish(&cfg)));
                }
                AppEvent::StateChange(state) => info!(%state, "connection state"),
                AppEvent::Stats(stats) => {
                    if config.stats_json {
                        match serde_json::to_string(&stats) {
                            Ok(line) => println!("{line}"),
                            Err(e) => warn!("stats serialization failed: {e}"),
                        }
                    }
                }
                AppEvent::Disconnected => {
                    error!("host unreachable; giving up");
                    break;
                }
            },
            _ = tick.tick() => {
                if let Some(handle) = pending.take_if(|h| h.is_finished()) {
                    finish_reconnect(&viewer, config.session_fingerprint(), handle.await);
                }
                if let Some(window) = &window {
                    if !pump_window(window, &mut mapper, &viewer, config.display.forward_input) {
                        break;
                    }
                }
            }
        }
    }

    // ── 5. Shutdown ─────────────────────────────────────────────

    info!("shutting down");
    viewer.stop();
    let stats = viewer.stats();
    info!(
        frames = stats.frames_rendered,
        lost = stats.packets_lost,
        reconnects = stats.reconnects,
        "session summary"
    );
    Ok(())
}

async fn establish_blocking(config: &ViewerAppConfig) -> Result<Established, StreamError> {
    let cfg = config.clone();
    tokio::task::spawn_blocking(move || connect::establish(&cfg))
        .await
        .map_err(|e| StreamError::Peer(format!("negotiation task failed: {e}")))?
}

fn finish_reconnect(
    viewer: &Viewer,
    fingerprint: &str,
    joined: Result<Result<Established, StreamError>, tokio::task::JoinError>,
) {
    let outcome = match joined {
        Ok(Ok(Established { peer, result })) => viewer.on_peer_connected(peer, &result, fingerprint),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(StreamError::Peer(format!("negotiation task failed: {e}"))),
    };
    match outcome {
        Ok(()) => info!(peer = %viewer.peer_addr(), "reconnected"),
        Err(e) => {
            warn!("reconnect attempt failed: {e}");
            viewer.report_reconnect_failed();
        }
    }
}

/// Drain window messages. Returns `false` once the window is closed.
fn pump_window(window: &NativeWindow, mapper: &mut InputMapper, viewer: &Viewer, forward: bool) -> bool {
    for event in window.poll_events() {
        if event == WindowEvent::Close {
            return false;
        }
        let Some(input) = mapper.translate(&event) else {
            continue;
        };
        if forward {
            if let Err(e) = viewer.send_input(input) {
                warn!("failed to send input: {e}");
            }
        }
    }
    true
}
