//! autolockd - Idle auto-lock daemon for Linux desktops.
//!
//! Watches screen and user-presence signals from systemd-logind, runs a
//! resettable idle countdown, and locks the session when it elapses.
//! Controlled by a host UI over a Unix-socket command channel.

mod config;
mod engine;
mod gateway;
mod notify;
mod privilege;
mod screen;

use crate::config::Config;
use crate::engine::{EngineHandle, IdleEngine, LockEvent};
use crate::gateway::Gateway;
use crate::notify::PresencePublisher;
use crate::privilege::{LogindGate, PrivilegeGate, logind::resolve_session_path};
use crate::screen::ScreenMonitor;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Idle auto-lock daemon.
///
/// Locks the session after a period of inactivity, controlled over a
/// Unix-socket command channel.
#[derive(Parser, Debug)]
#[command(name = "autolockd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (log lock calls instead of issuing them).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Command socket path (overrides config).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Print normalized screen events to stdout.
    #[arg(long)]
    print_events: bool,

    /// Run in oneshot mode: connect, print a few events, then exit.
    #[arg(long)]
    oneshot: bool,

    /// Number of events to capture in oneshot mode.
    #[arg(long, default_value = "5")]
    oneshot_count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("autolockd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }

    info!("Configuration loaded (dry_run={})", config.dry_run);

    // Oneshot mode
    if args.oneshot {
        return run_oneshot(args.oneshot_count, args.print_events).await;
    }

    // Normal daemon mode
    run_daemon(config, args.print_events).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("autolockd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Run in oneshot mode: capture a few screen events and exit.
async fn run_oneshot(count: usize, print_events: bool) -> Result<()> {
    info!("Running in oneshot mode, capturing {} events", count);

    let mut monitor = ScreenMonitor::connect().await?;

    match monitor.initial_screen_on().await {
        Ok(on) => info!("Initial screen state: {}", if on { "on" } else { "off" }),
        Err(e) => warn!("Could not query initial screen state: {}", e),
    }

    let mut captured = 0;
    while captured < count {
        match tokio::time::timeout(Duration::from_secs(30), monitor.next_event()).await {
            Ok(Ok(event)) => {
                captured += 1;
                if print_events {
                    println!("[{captured}] {event:?}");
                } else {
                    info!("Event {}/{}: {:?}", captured, count, event);
                }
            }
            Ok(Err(e)) => {
                error!("Screen event error: {}", e);
                break;
            }
            Err(_) => {
                warn!("Timeout waiting for screen events");
                break;
            }
        }
    }

    info!("Oneshot mode complete, captured {} events", captured);
    Ok(())
}

/// Run daemon event loop.
async fn run_daemon(config: Config, print_events: bool) -> Result<()> {
    let conn = zbus::Connection::system()
        .await
        .context("Failed to connect to system DBus")?;

    let session_path = resolve_session_path(&conn).await?;
    info!("Resolved session path: {}", session_path);

    let gate: Arc<dyn PrivilegeGate> = Arc::new(LogindGate::new(
        conn.clone(),
        session_path.clone(),
        config.dry_run,
    ));
    let engine = IdleEngine::spawn(gate.clone(), config.default_timeout());

    let shutdown = CancellationToken::new();

    // Screen event relay
    let monitor = ScreenMonitor::subscribe(conn, session_path).await?;
    tokio::spawn(relay_events(
        monitor,
        engine.clone(),
        shutdown.clone(),
        print_events,
    ));

    // Foreground presence notification
    if config.show_notification {
        match PresencePublisher::connect().await {
            Ok(publisher) => {
                tokio::spawn(publisher.run(engine.status(), shutdown.clone()));
            }
            Err(e) => warn!("Desktop notifications unavailable: {}", e),
        }
    }

    // Command channel
    let socket_path = gateway::socket_path(config.socket_path.as_deref())?;
    let listener = gateway::bind(&socket_path)?;
    info!("Command channel listening on {}", socket_path.display());

    let command_gateway = Arc::new(Gateway::new(gate, engine.clone(), config.default_timeout()));
    let server = tokio::spawn(command_gateway.serve(listener, shutdown.clone()));

    info!("Daemon started");

    wait_for_signal().await?;

    info!("Shutting down");
    shutdown.cancel();
    engine.stop();
    let _ = server.await;
    let _ = std::fs::remove_file(&socket_path);

    Ok(())
}

/// Feed screen events to the engine until shutdown.
///
/// Seeds the engine with the actual screen state first, so its belief is
/// correct even when the daemon starts with the screen already off.
async fn relay_events(
    mut monitor: ScreenMonitor,
    engine: EngineHandle,
    shutdown: CancellationToken,
    print_events: bool,
) {
    match monitor.initial_screen_on().await {
        Ok(true) => engine.dispatch(LockEvent::ScreenOn),
        Ok(false) => engine.dispatch(LockEvent::ScreenOff),
        Err(e) => {
            warn!("Could not query initial screen state, assuming on: {}", e);
            engine.dispatch(LockEvent::ScreenOn);
        }
    }

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            event = monitor.next_event() => match event {
                Ok(event) => {
                    if print_events {
                        println!("[EVENT] {event:?}");
                    }
                    engine.dispatch(event);
                }
                Err(e) => {
                    error!("Screen event error: {}", e);
                    break;
                }
            }
        }
    }

    debug!("Screen event relay stopped");
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for SIGINT")?,
        _ = term.recv() => {}
    }

    Ok(())
}
