//! WebSocket server: accept loop and per-connection task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from peers.
//! 3. Upgrading each connection to a WebSocket within `connect_timeout`.
//! 4. Spawning one task per connection that drives it through
//!    [`serve_connection`].
//! 5. Stopping when the `running` flag is cleared, then letting every open
//!    session run its cleanup before returning.
//!
//! Sessions share nothing in-process except the store handle and the
//! delivery notifier; one slow peer never blocks the accept loop or another
//! session.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::application::session::BrokerContext;
use crate::domain::config::ServerConfig;
use crate::domain::records::DeleteSummary;
use crate::infrastructure::connection::{serve_connection, ConnectionContext, ConnectionSettings};
use crate::infrastructure::notifier::DeliveryNotifier;

/// Accept-loop interval for re-checking the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Slack on top of `close_timeout` for sessions to finish after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A bound, not yet running, broker listener.
pub struct WsServer {
    listener: TcpListener,
    ctx: ConnectionContext,
    connect_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl WsServer {
    /// Binds the listener described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a timing setting is zero, the bind address is
    /// invalid or the port cannot be bound.
    pub async fn bind(config: &ServerConfig, broker: BrokerContext) -> anyhow::Result<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        Ok(Self {
            listener,
            ctx: ConnectionContext {
                broker,
                notifier: Arc::new(DeliveryNotifier::new()),
                settings: ConnectionSettings::from(config),
                shutdown: shutdown_rx,
            },
            connect_timeout: config.connect_timeout(),
            shutdown,
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    /// Accepts connections until `running` is set to `false`.
    ///
    /// Open sessions are then told to stop and awaited, so each one removes
    /// its directory row and queue.  Sessions that outlast the grace period
    /// are aborted.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        info!("broker listening on {}", self.local_addr()?);
        let mut connections = JoinSet::new();

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Reap finished sessions so the set does not grow unbounded.
            while connections.try_join_next().is_some() {}

            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    let ctx = self.ctx.clone();
                    let connect_timeout = self.connect_timeout;
                    let span = info_span!("connection", id = %Uuid::new_v4(), peer = %peer_addr);
                    connections.spawn(
                        handle_connection(stream, peer_addr, ctx, connect_timeout).instrument(span),
                    );
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // No connection within ACCEPT_POLL; re-check the flag.
                }
            }
        }

        if connections.is_empty() {
            return Ok(());
        }

        info!(open = connections.len(), "closing open sessions");
        self.shutdown.send_replace(true);
        let grace = self.ctx.settings.close_timeout + SHUTDOWN_GRACE;
        let drained = timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                open = connections.len(),
                "sessions still open after {grace:?}; aborting"
            );
            connections.abort_all();
        }
        Ok(())
    }
}

/// Binds and runs the broker until `running` is cleared.
pub async fn run_server(
    config: &ServerConfig,
    broker: BrokerContext,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    WsServer::bind(config, broker).await?.run(running).await
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    connect_timeout: Duration,
) {
    info!("new connection");
    match run_connection(stream, peer_addr, ctx, connect_timeout).await {
        Ok(summary) => info!(device = summary.device, mq = summary.mq, "session finished"),
        Err(e) => warn!("connection failed: {e:#}"),
    }
}

async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: ConnectionContext,
    connect_timeout: Duration,
) -> anyhow::Result<DeleteSummary> {
    // The broker's side of the socket is the peer's `send` address.
    let local = stream
        .local_addr()
        .context("failed to read local socket address")?;

    let ws = timeout(connect_timeout, accept_async(stream))
        .await
        .map_err(|_| anyhow!("WebSocket upgrade timed out after {connect_timeout:?}"))?
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    Ok(serve_connection(ws, local.into(), peer_addr.into(), ctx).await)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
