// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! isotask CLI
//!
//! Small demos exercising worker processes, worker threads, concurrency
//! limits and termination on return.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use isotask::ExecConfig;

mod commands;

#[derive(Parser)]
#[command(name = "isotask")]
#[command(author, version, about = "Run functions in worker processes and threads", long_about = None)]
struct Cli {
    /// Execution config file (TOML). ISOTASK_* environment variables override it.
    #[arg(long, global = true, value_name = "FILE", env = "ISOTASK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sleep in a worker process, then return twice the input
    Sleep {
        /// Seconds to sleep
        #[arg(long, default_value = "1")]
        secs: u64,
    },

    /// Raise an error in a worker process and burst it
    Fail,

    /// Show a second call being rejected at max_concurrent = 1
    Limit,

    /// Return from a worker that ignores SIGTERM and keeps running, then
    /// terminate it
    Linger {
        /// Grace period before the forced kill (milliseconds)
        #[arg(long, default_value = "500")]
        grace_ms: u64,
    },

    /// Same as `sleep`, on a worker thread
    Thread {
        /// Seconds to sleep
        #[arg(long, default_value = "1")]
        secs: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<ExecConfig> {
    let config = match path {
        Some(path) => ExecConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ExecConfig::default(),
    };
    Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let config = load_config(cli.config.as_ref())?;
    tracing::debug!("Using {:?}", config);

    match cli.command {
        Commands::Sleep { secs } => commands::process::sleep(config, secs),
        Commands::Fail => commands::process::fail(config),
        Commands::Limit => commands::process::limit(config),
        Commands::Linger { grace_ms } => commands::process::linger(config, grace_ms),
        Commands::Thread { secs } => commands::thread::sleep(config, secs),
    }
}
