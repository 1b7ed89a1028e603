//! MQ relay broker: entry point.
//!
//! Loads (or creates) the TOML config, opens the store, applies the startup
//! reset and serves WebSocket peers until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! mq-broker [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Config file, created with defaults if absent [default: mq.toml]
//!   --bind   <IP>     Override server.bind_address
//!   --port   <PORT>   Override server.port
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable    | Description                                   |
//! |-------------|-----------------------------------------------|
//! | `MQ_CONFIG` | Config file path                              |
//! | `MQ_BIND`   | Bind address                                  |
//! | `MQ_PORT`   | Listener port                                 |
//! | `RUST_LOG`  | Log filter; falls back to `server.log_level`  |

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mq_broker::application::{BrokerContext, SessionPolicy, Store};
use mq_broker::domain::config::{load_or_init, BrokerConfig, ConfigSource};
use mq_broker::infrastructure::{open_store, run_server};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Credential-gated WebSocket message relay.
#[derive(Debug, Parser)]
#[command(name = "mq-broker", about = "Credential-gated WebSocket message relay", version)]
struct Cli {
    /// Path of the TOML config file.
    ///
    /// A missing file is created with default settings.
    #[arg(long, default_value = "mq.toml", env = "MQ_CONFIG")]
    config: PathBuf,

    /// IP address to bind to, overriding `server.bind_address`.
    #[arg(long, env = "MQ_BIND")]
    bind: Option<String>,

    /// Port to listen on, overriding `server.port`.
    #[arg(long, env = "MQ_PORT")]
    port: Option<u16>,
}

impl Cli {
    /// Applies the command-line overrides on top of the file config.
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = load_or_init(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    // Flags and env only touch the listener address, never the validated timings.
    cli.apply(&mut config);

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    match source {
        ConfigSource::Loaded => info!("config loaded from {}", cli.config.display()),
        ConfigSource::Generated => {
            info!("default config written to {}", cli.config.display())
        }
    }

    // ── Store ─────────────────────────────────────────────────────────────────
    // Opening also applies the configured startup reset, before any peer connects.
    let store = open_store(&config.database).await?;
    log_stats(store.as_ref(), "store ready").await;

    if !config.server.enabled {
        warn!("server.enabled is false; exiting without serving");
        return Ok(());
    }

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Main server loop ──────────────────────────────────────────────────────
    let broker = BrokerContext::new(Arc::clone(&store), SessionPolicy::from(&config.policy));
    // Returns once the flag clears and open sessions have cleaned up.
    run_server(&config.server, broker, running).await?;

    log_stats(store.as_ref(), "broker stopped").await;
    Ok(())
}

async fn log_stats(store: &dyn Store, what: &str) {
    match store.stats().await {
        Ok(stats) => info!(
            queued = stats.queued,
            devices = stats.devices,
            audit = stats.audit,
            "{what}"
        ),
        Err(e) => warn!("{what}; stats unavailable: {e}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange: parse with no arguments (all defaults apply)
        let cli = Cli::parse_from(["mq-broker"]);

        // Assert
        assert_eq!(cli.config, PathBuf::from("mq.toml"));
        assert!(cli.bind.is_none());
        assert!(cli.port.is_none());
    }

    #[test]
    fn test_cli_overrides_config() {
        // Arrange
        let cli = Cli::parse_from(["mq-broker", "--bind", "127.0.0.1", "--port", "9100"]);
        let mut config = BrokerConfig::default();

        // Act
        cli.apply(&mut config);

        // Assert
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_cli_without_overrides_keeps_file_values() {
        let cli = Cli::parse_from(["mq-broker", "--config", "/etc/mq/broker.toml"]);
        let mut config = BrokerConfig::default();
        config.server.port = 7000;

        cli.apply(&mut config);

        assert_eq!(config.server.port, 7000);
        assert_eq!(cli.config, PathBuf::from("/etc/mq/broker.toml"));
    }

    #[test]
    fn test_cli_rejects_invalid_port() {
        assert!(Cli::try_parse_from(["mq-broker", "--port", "99999"]).is_err());
    }
}
