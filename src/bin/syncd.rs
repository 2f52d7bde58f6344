//! `syncd` process entry point (spec §6 CLI surface).
//!
//! Parses `--config`/`--data-dir`/`--log-level`/`--foreground`, loads and
//! validates the JSON config, opens the [`Store`], starts the
//! [`Coordinator`], and waits for `SIGINT`/`SIGTERM` to run the shutdown
//! sequence. Exit codes 0-4 exactly as spec §6 defines them.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;

use clap::Parser;

use syncd::config::{Cli, Config, ExitCode, LogLevel};
use syncd::coordinator::Coordinator;
use syncd::progress::ProgressBus;
use syncd::store::Store;

const DEFAULT_CONFIG_PATH: &str = "/etc/syncd/config.json";
const DEFAULT_DATA_DIR: &str = "/var/lib/syncd";

#[tokio::main]
async fn main() -> ProcessExitCode {
    let cli = Cli::parse();
    to_process_exit_code(run(cli).await)
}

fn to_process_exit_code(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}

async fn run(cli: Cli) -> ExitCode {
    let log_level = cli.log_level.unwrap_or(LogLevel::Info);
    init_logging(log_level);

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(path = %config_path.display(), %err, "failed to load configuration");
            return ExitCode::ConfigError;
        }
    };

    let data_dir = cli.data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let store = match Store::open(&data_dir) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(path = %data_dir.display(), %err, "failed to open store");
            return ExitCode::StoreError;
        }
    };

    let snapshot_interval = syncd::store::DEFAULT_SNAPSHOT_INTERVAL;
    let snapshot_task = Store::spawn_snapshot_task(store.clone(), snapshot_interval);

    let progress = ProgressBus::default();
    let coordinator = Coordinator::new(config, store, progress);

    tracing::info!(foreground = cli.foreground, "syncd started");

    wait_for_shutdown_signal().await;

    tracing::info!("shutdown signal received");
    coordinator.shutdown().await;
    snapshot_task.abort();

    ExitCode::Clean
}

fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
