//! MQ relay peer: entry point.
//!
//! Connects to the broker, performs the TOTP handshake, prints the verdict
//! and then logs every frame relayed to this peer until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! mq-client [OPTIONS]
//!
//! Options:
//!   --url    <URL>     Broker URL [default: ws://127.0.0.1:8500]
//!   --secret <SECRET>  Shared secret [default: random]
//!   --code   <CODE>    Code to present [default: computed from the secret]
//!   --device <ID>      Device identifier [default: the secret]
//!   --type   <TYPE>    Device type, visible to directory queries
//! ```
//!
//! Other peers find this one by querying the directory, for example
//! `{"parameters.type": "<TYPE>"}`, and address messages to the `receive`
//! address printed on connect.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mq_client::{ClientError, HandshakeRequest, RelayClient};

/// How long one `next_relayed` call waits before the loop re-checks Ctrl+C.
const RELAY_WAIT: Duration = Duration::from_secs(1);

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Peer for the MQ relay broker.
#[derive(Debug, Parser)]
#[command(name = "mq-client", about = "Peer for the MQ relay broker", version)]
struct Cli {
    /// WebSocket URL of the broker.
    #[arg(long, default_value = "ws://127.0.0.1:8500", env = "MQ_URL")]
    url: String,

    /// Shared secret (base32).  A random one is generated when omitted.
    #[arg(long, env = "MQ_SECRET")]
    secret: Option<String>,

    /// Code to present instead of the one computed from the secret.
    #[arg(long)]
    code: Option<String>,

    /// Device identifier.  Defaults to the secret.
    #[arg(long)]
    device: Option<String>,

    /// Device type stored in the directory.
    #[arg(long = "type")]
    device_type: Option<String>,
}

impl Cli {
    /// Builds the handshake request from the flags.
    fn handshake(&self) -> Result<HandshakeRequest, ClientError> {
        let secret = self.secret.clone().unwrap_or_else(random_secret);
        let mut request = HandshakeRequest::for_secret(&secret)?;
        if let Some(code) = &self.code {
            request = request.with_field("code", code.as_str());
        }
        request = request.with_field("device", self.device.as_deref().unwrap_or(&secret));
        if let Some(device_type) = &self.device_type {
            request = request.with_field("type", device_type.as_str());
        }
        Ok(request)
    }
}

/// The last twelve hex characters of a fresh UUID.  Both ends coerce it to
/// base32 the same way, so any string works as a secret.
fn random_secret() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[simple.len() - 12..].to_string()
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let request = cli.handshake()?;

    let (mut client, reply) = RelayClient::connect(&cli.url, &request)
        .await
        .with_context(|| format!("failed to join broker at {}", cli.url))?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    info!(address = %client.address(), "waiting for relayed messages (Ctrl+C to quit)");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("failed to listen for Ctrl+C signal: {e}");
                }
                info!("received Ctrl+C; leaving");
                break;
            }
            relayed = client.next_relayed(RELAY_WAIT) => match relayed {
                Ok(Some(message)) => info!(%message, "relayed"),
                Ok(None) => {}
                Err(ClientError::Broker(error)) => warn!("broker reported: {error}"),
                Err(e) => return Err(e).context("connection to broker lost"),
            },
        }
    }

    client.close().await.context("failed to close connection")?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["mq-client"]);

        assert_eq!(cli.url, "ws://127.0.0.1:8500");
        assert!(cli.secret.is_none());
        assert!(cli.device_type.is_none());
    }

    #[test]
    fn test_handshake_uses_flags() {
        // Arrange
        let cli = Cli::parse_from([
            "mq-client",
            "--secret",
            "JBSWY3DPEHPK3PXP",
            "--code",
            "000000",
            "--device",
            "phone-1",
            "--type",
            "worker",
        ]);

        // Act
        let request = cli.handshake().unwrap();

        // Assert
        assert_eq!(request.secret, Some(json!("JBSWY3DPEHPK3PXP")));
        assert_eq!(request.extra["code"], json!("000000"));
        assert_eq!(request.extra["device"], json!("phone-1"));
        assert_eq!(request.extra["type"], json!("worker"));
    }

    #[test]
    fn test_handshake_defaults_device_to_secret_and_computes_code() {
        let cli = Cli::parse_from(["mq-client", "--secret", "JBSWY3DPEHPK3PXP"]);

        let request = cli.handshake().unwrap();

        assert_eq!(request.extra["device"], json!("JBSWY3DPEHPK3PXP"));
        let code = request.extra["code"].as_str().unwrap();
        assert_eq!(code.len(), 6);
        assert!(!request.extra.contains_key("type"));
    }

    #[test]
    fn test_random_secret_shape() {
        let secret = random_secret();

        assert_eq!(secret.len(), 12);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, random_secret());
    }
}
