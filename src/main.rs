//! Vault Proxy
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                     VAULT PROXY                       │
//!                  │                                                      │
//!                  │  ┌──────────┐   ┌────────┐   ┌───────┐               │
//!   Auto-auth  ◀───┼──│   auth   │──▶│  sink  │──▶│ files │               │
//!   (upstream)     │  │ handler  │   │ server │   └───────┘               │
//!                  │  └──────────┘   └───┬────┘                           │
//!                  │                      │ in-memory token               │
//!                  │                      ▼                               │
//!   Client ────────┼─▶ net ──▶ http ──▶ cache ──▶ proxy ──▶ upstream ─────┼──▶ Server
//!                  │  listener router  (lease)   (consistency)            │
//!                  │                                                      │
//!                  │  lifecycle: run group, reload, shutdown, PID file    │
//!                  └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use vault_proxy::config::{load_configs, ConfigWatcher, VaultOverrides};
use vault_proxy::net::install_crypto_provider;
use vault_proxy::observability::logging;
use vault_proxy::Orchestrator;

#[derive(Parser)]
#[command(name = "vault-proxy")]
#[command(about = "Authenticating and caching sidecar for a secrets server", long_about = None)]
struct Cli {
    /// Configuration file or directory. May be repeated; later files win.
    #[arg(short, long = "config", required = true)]
    config: Vec<PathBuf>,

    /// Reload automatically when a configuration file changes.
    #[arg(long)]
    watch_config: bool,

    /// Log level, overriding the configuration file.
    #[arg(long, env = "VAULT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: standard or json.
    #[arg(long, env = "VAULT_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(flatten)]
    vault: VaultOverrides,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_configs(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    cli.vault.apply(&mut config.vault);
    if cli.log_level.is_some() {
        config.log_level = cli.log_level;
    }
    if cli.log_format.is_some() {
        config.log_format = cli.log_format;
    }

    let log = match logging::init(config.log_level(), config.log_format()) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Error initializing logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    install_crypto_provider();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.vault.address,
        listeners = config.listeners.len(),
        "vault-proxy starting"
    );

    let orchestrator = Orchestrator::new(config, cli.config.clone(), log).with_os_signals();

    // Dropping the watcher stops it, so it lives until `run` returns.
    let _watcher = if cli.watch_config {
        match ConfigWatcher::new(&cli.config, orchestrator.reload_handle()).run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch configuration files");
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    match orchestrator.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vault-proxy exited with error");
            ExitCode::FAILURE
        }
    }
}
