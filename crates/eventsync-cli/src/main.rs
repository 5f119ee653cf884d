//! eventsync - a command-line client for the event-discovery API that keeps
//! working offline.
//!
//! Reads are served from the local store when the server cannot be reached,
//! and writes made offline are queued for `eventsync queue sync`.

mod commands;
mod config;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventsync_core::models::{EventCategory, UserRole};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "eventsync", version, about = "Offline-first client for the event-discovery API")]
struct Cli {
    /// API base URL (overrides the config file)
    #[arg(long, env = "EVENTSYNC_API_URL", global = true)]
    api_url: Option<String>,

    /// Directory holding the local store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// User whose agenda to read and change
    #[arg(long, env = "EVENTSYNC_USER", global = true)]
    user: Option<String>,

    /// Bearer token for the API
    #[arg(long, env = "EVENTSYNC_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List events
    Events {
        #[arg(long)]
        category: Option<EventCategory>,
        /// Only events on this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Show the next N events instead
        #[arg(long, value_name = "N")]
        upcoming: Option<usize>,
    },
    /// Show one event
    Event { id: String },
    /// List traffic alerts
    Alerts {
        /// Only active alerts
        #[arg(long)]
        active: bool,
    },
    /// List tourist routes
    Routes,
    /// List users
    Users {
        #[arg(long)]
        role: Option<UserRole>,
    },
    /// Show or change the agenda
    Agenda {
        #[command(subcommand)]
        action: Option<AgendaCommand>,
    },
    /// Inspect and replay queued offline changes
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },
    /// Print live alert notifications until Ctrl-C
    Watch,
    /// Show store, queue and connection settings
    Status,
    /// Show or update the saved configuration
    Config {
        #[arg(long)]
        set_api_url: Option<String>,
        #[arg(long)]
        set_user: Option<String>,
        #[arg(long)]
        set_data_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum AgendaCommand {
    Attend { event_id: String },
    Interest { event_id: String },
    NotGoing { event_id: String },
    Remove { event_id: String },
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// List queued operations, oldest first
    List,
    /// Replay due operations
    Sync {
        /// Keep syncing every SECS seconds until Ctrl-C
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
    /// Replay one operation now
    Retry { id: String },
    /// Drop operations that have failed
    ClearFailed,
    /// Drop every queued operation
    Clear,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "eventsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());
    info!("eventsync starting");

    let mut config = Config::load().context("Failed to load config")?;
    if let Some(ref dir) = cli.data_dir {
        config.data_dir = Some(dir.clone());
    }

    let ctx = commands::Context::new(config, &cli)?;
    commands::run(&ctx, cli.command).await
}
