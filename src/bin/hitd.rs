//! Hit Daemon - visit counter with live badge updates
//!
//! Runs the hit counter over a Unix socket: clients record visits, request
//! badges and subscribe to live count updates.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! hitd start --config /etc/hitd.toml
//!
//! # Print the effective configuration
//! hitd check-config
//!
//! # Check whether a daemon answers on the socket
//! hitd status
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hit_protocol::{ClientMessage, DaemonMessage};
use hitd::server::HitServer;
use hitd::{Collaborators, Handler, HitConfig};

/// How long `status` waits for the daemon to answer
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Hit counter daemon
#[derive(Parser, Debug)]
#[command(name = "hitd", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Socket path (overrides the config file and HIT_SOCKET)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon in the foreground
    Start,
    /// Validate the configuration and print it
    CheckConfig,
    /// Ping a running daemon
    Status,
}

fn load_config(args: &Args) -> Result<HitConfig> {
    let mut config =
        HitConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }

    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Start) {
        Command::Start => run_daemon(config),
        Command::CheckConfig => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{text}");
            Ok(())
        }
        Command::Status => check_status(config),
    }
}

#[tokio::main]
async fn run_daemon(config: HitConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("hitd=info".parse()?)
                .add_directive("hit_core=info".parse()?)
                .add_directive("hit_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Hit daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let handler = Handler::new(&config, Collaborators::in_memory(&config))
        .await
        .context("Failed to start handler")?;
    let handler = Arc::new(handler);

    let server = HitServer::new(&config.socket_path, Arc::clone(&handler), cancel_token);

    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;
    handler.shutdown().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Hit daemon stopped");
    Ok(())
}

#[tokio::main]
async fn check_status(config: HitConfig) -> Result<()> {
    let socket_path = config.socket_path;

    let reply = timeout(STATUS_TIMEOUT, ping(&socket_path))
        .await
        .context("Daemon did not answer in time")?;

    match reply {
        Ok(client_id) => {
            println!("Daemon is running");
            println!("Socket: {}", socket_path.display());
            println!("Session: {client_id}");
            Ok(())
        }
        Err(e) => {
            eprintln!("Daemon is not running: {e:#}");
            process::exit(1);
        }
    }
}

/// Connects, handshakes and pings; returns the assigned client id.
async fn ping(socket_path: &std::path::Path) -> Result<String> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    for msg in [
        ClientMessage::connect(Some("hitd-status".to_string())),
        ClientMessage::ping(1),
        ClientMessage::disconnect(),
    ] {
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    writer.flush().await?;

    let mut client_id = None;
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<DaemonMessage>(&line)? {
            DaemonMessage::Connected { client_id: id, .. } => client_id = Some(id),
            DaemonMessage::Pong { .. } => break,
            DaemonMessage::Rejected { reason, .. } => bail!("Rejected: {reason}"),
            _ => {}
        }
    }

    client_id.context("Daemon closed the connection before answering")
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
