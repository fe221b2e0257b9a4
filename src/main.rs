//! Liveness Bridge Server
//!
//! WebSocket server that greets and echoes text messages, or runs an
//! "HSK"/"HSK_DONE" handshake followed by a "PING"/"PONG" heartbeat.

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::Settings;
use server::{EchoReply, Mode, ServerEvent, WebSocketServer};

/// Liveness Bridge Server
///
/// WebSocket echo and heartbeat server
#[derive(Parser, Debug)]
#[command(name = "liveness-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Protocol served on every connection
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Reply style of the echo protocol
    #[arg(long, value_enum)]
    reply: Option<EchoReply>,

    /// Seconds between heartbeats
    #[arg(long)]
    interval: Option<u64>,

    /// Print every server event as a JSON line on stdout
    #[arg(long)]
    json_events: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the settings file (if any) and apply command line overrides
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(bind) = &self.bind {
            settings.bind = bind.clone();
        }
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(reply) = self.reply {
            settings.reply = reply;
        }
        if let Some(interval) = self.interval {
            settings.heartbeat_interval_secs = interval;
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let log_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Liveness Bridge v{}", env!("CARGO_PKG_VERSION"));

    let settings = args.settings()?;
    info!("Serving {:?} protocol", settings.mode);

    let server = Arc::new(
        WebSocketServer::bind(settings.server_config(), settings.handler_settings()).await?,
    );
    info!("Server address: {}", server.local_addr());

    if args.json_events {
        let events = server.subscribe();
        tokio::spawn(print_events(events));
    }

    // Spawn shutdown signal handler
    let server_handle = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Returns once the listener stopped and open connections were drained
    server.run().await?;
    info!("Server shutdown complete");
    Ok(())
}

/// Write each event as one JSON line on stdout
async fn print_events(mut events: tokio::sync::broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to serialize event: {}", e),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event output lagged, {} events dropped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_defaults() {
        let args = Args::parse_from([
            "liveness-bridge",
            "--port",
            "3330",
            "--mode",
            "heartbeat",
            "--interval",
            "7",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.port, 3330);
        assert_eq!(settings.mode, Mode::Heartbeat);
        assert_eq!(settings.heartbeat_interval_secs, 7);
        assert_eq!(settings.reply, EchoReply::Echo);
    }

    #[test]
    fn test_args_reject_zero_interval() {
        let args = Args::parse_from(["liveness-bridge", "--interval", "0"]);
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_args_config_file_then_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "port = 9100\nreply = \"fixed\"\n").unwrap();

        let args = Args::parse_from([
            "liveness-bridge",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9200",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.port, 9200);
        assert_eq!(settings.reply, EchoReply::Fixed);
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
