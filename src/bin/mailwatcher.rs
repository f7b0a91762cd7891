//! `mailwatcher`: the long-running daemon
//!
//! Loads configuration, opens the SQLite mailbox registry, binds the
//! control socket, and runs until a shutdown signal. Exit code 0 on clean
//! shutdown, 1 on startup failure (bad config, can't bind socket, can't
//! open store).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mailwatcher::broadcaster;
use mailwatcher::config::Config;
use mailwatcher::control_server::ControlServer;
use mailwatcher::mailbox::{MailboxStore, SqliteMailboxStore};
use mailwatcher::supervisor::WatcherSupervisor;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailwatcher", about = "Watches IMAP mailboxes for verification codes")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,
    /// Overrides the config's `database` path.
    #[arg(long)]
    db: Option<String>,
    /// Overrides the config's `socket_path`.
    #[arg(long)]
    socket: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = cli.db {
        config.database = db;
    }
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    let store: Arc<dyn MailboxStore> = match SqliteMailboxStore::open(&config.database) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, database = %config.database, "failed to open mailbox store");
            return ExitCode::FAILURE;
        }
    };

    let (codes_tx, codes_rx) = mpsc::channel(1);
    let supervisor = Arc::new(WatcherSupervisor::new(
        Arc::clone(&store),
        config.subjects.clone(),
        config.extractors.clone(),
        codes_tx,
    ));

    if let Err(err) = supervisor.start_all().await {
        tracing::error!(error = %err, "failed to start watchers from the registry");
    }

    let socket_path = PathBuf::from(&config.socket_path);
    let control_server = match ControlServer::bind(&socket_path, Arc::clone(&store), Arc::clone(&supervisor)) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, path = %socket_path.display(), "failed to bind control socket");
            return ExitCode::FAILURE;
        }
    };

    let subscribers = control_server.subscribers();
    let broadcaster_handle = tokio::spawn(broadcaster::run(codes_rx, subscribers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(control_server.run(shutdown_rx));

    tracing::info!("mailwatcher daemon running");
    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    supervisor.stop_all().await;
    supervisor.await_shutdown().await;

    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;
    drop(store);
    broadcaster_handle.abort();

    ExitCode::SUCCESS
}

/// Waits for Ctrl+C or, on Unix, SIGTERM, whichever arrives first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
