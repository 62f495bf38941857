//! tracegate: control client for recording sessions.
//!
//! Starts, stops, inspects and lists recordings on a tracegated host, fetches
//! finished artifacts, and emits custom events into active recordings.

mod client;
mod commands;
mod config;

use clap::{Parser, Subcommand};
use client::ControlClient;
use std::path::PathBuf;
use tracegate_core::SessionFilter;
use tracing::error;

/// tracegate: recording session client
#[derive(Parser)]
#[command(name = "tracegate", version, about = "Control client for on-demand diagnostic recordings")]
struct Cli {
    /// Control surface address (host:port)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Bearer token
    #[arg(long, global = true, env = "TRACEGATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a recording session
    Start {
        /// Preset name (defaults to the config file's preset)
        #[arg(short, long)]
        preset: Option<String>,
        /// Maximum duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Short label folded into the artifact name
        #[arg(short, long)]
        label: Option<String>,
        /// Extra key=value labels
        #[arg(long = "tag", value_parser = commands::sessions::parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Stop a running session and store its artifact
    Stop {
        /// Session ID
        id: String,
    },

    /// Show one session
    Get {
        /// Session ID
        id: String,
    },

    /// List sessions
    List {
        /// Only sessions in this state
        #[arg(long, value_parser = commands::sessions::parse_state)]
        state: Option<tracegate_core::SessionState>,
        /// Only sessions owned by this principal
        #[arg(long)]
        owner: Option<String>,
        /// Only pending, running or stopping sessions
        #[arg(long)]
        active: bool,
    },

    /// Download a completed session's artifact
    Fetch {
        /// Session ID
        id: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Emit a custom event into active recordings
    Emit {
        /// Event category
        category: String,
        /// Event name
        name: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("tracegate=debug,tracegate_cli=debug,tracegate_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("tracegate=warn,tracegate_cli=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".tracegate").join("cli.toml").to_string_lossy().to_string()
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tracegate: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI overrides config.
    let server = cli.server.clone().unwrap_or(cfg.default.server.clone());
    let token = cli.token.clone().unwrap_or(cfg.default.token.clone());

    if let Err(e) = run(cli, cfg, &server, &token).await {
        error!("{:#}", e);
        eprintln!("tracegate: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cfg: config::Config, server: &str, token: &str) -> anyhow::Result<()> {
    let mut client = ControlClient::connect(server, token).await?;
    let json = cli.json;

    match cli.command {
        Command::Start {
            preset,
            duration,
            label,
            tags,
        } => {
            let preset = preset.unwrap_or(cfg.default.preset);
            commands::sessions::run_start(&mut client, &preset, duration, label, tags, json).await
        }
        Command::Stop { id } => commands::sessions::run_stop(&mut client, &id, json).await,
        Command::Get { id } => commands::sessions::run_get(&mut client, &id).await,
        Command::List {
            state,
            owner,
            active,
        } => {
            let filter = SessionFilter {
                state,
                owner: owner.map(tracegate_core::Identity::new),
                active_only: active,
            };
            commands::sessions::run_list(&mut client, filter, json).await
        }
        Command::Fetch { id, output } => {
            commands::sessions::run_fetch(&mut client, &id, output.as_deref()).await
        }
        Command::Emit {
            category,
            name,
            payload,
        } => commands::emit::run(&mut client, &category, &name, payload.as_deref()).await,
    }
}
