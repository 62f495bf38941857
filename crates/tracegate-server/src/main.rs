//! tracegated: control-surface daemon for on-demand diagnostic recordings.
//!
//! Accepts line-delimited JSON control requests over TCP, authenticates them
//! by bearer token, and drives recording sessions through the controller.

mod auth;
mod config;
mod control;
mod persist;
mod server;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::TracegateServer;
use std::path::PathBuf;
use tracing::{error, info};

/// tracegated: recording session daemon
#[derive(Parser, Debug)]
#[command(name = "tracegated", version, about = "Recording session daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.tracegate/config.toml")]
    config: String,

    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Maximum session duration in seconds
    #[arg(long)]
    max_duration: Option<u64>,

    /// Directory for finished artifacts
    #[arg(long)]
    artifact_dir: Option<String>,

    /// Print the SHA-256 digest of a token for the config file and exit
    #[arg(long, value_name = "TOKEN")]
    hash_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(token) = cli.hash_token.as_deref() {
        println!("{}", auth::hash_token(token));
        return;
    }

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tracegated");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let overrides = Overrides {
        listen: cli.listen,
        max_sessions: cli.max_sessions,
        max_duration: cli.max_duration,
        artifact_dir: cli.artifact_dir,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match TracegateServer::new(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to create server");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal, then drain
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %format!("{e:#}"), "server error");
        std::process::exit(1);
    }

    info!("tracegated stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
