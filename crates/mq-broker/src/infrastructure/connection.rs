//! Drives one WebSocket through the session state machine.
//!
//! ```text
//! handshake frame ──► Session::complete_handshake ──► reply
//!                                                       │ verified
//!                                                       ▼
//!             ┌──── select! ───────────────────────────────────────┐
//!             │ peer frame      → Session::handle → frames          │
//!             │ delivery notify ┐                                   │
//!             │ poll tick       ├→ drain Session::next_delivery     │
//!             │ keepalive tick  → Ping / pong timeout               │
//!             └─────────────────────────────────────────────────────┘
//!                                   │ transport closed, error, panic
//!                                   │ or broker shutdown
//!                                   ▼
//!                             Session::close
//! ```
//!
//! Only transport failures and broker shutdown end the loop.  Relay errors
//! become `{"error": ...}` frames and the loop continues.  `Session::close`
//! runs on every exit path, including a panic inside the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use mq_core::otp::unix_now;
use mq_core::{Address, ErrorFrame, Inbound};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::application::session::{BrokerContext, HandshakeError, Session, SessionState};
use crate::domain::config::ServerConfig;
use crate::domain::records::DeleteSummary;
use crate::infrastructure::notifier::DeliveryNotifier;

/// Per-connection timing knobs, taken from `[server]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub poll_interval: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub close_timeout: Duration,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            poll_interval: config.poll_interval(),
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
            close_timeout: config.close_timeout(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Everything a connection task needs, cloned once per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub broker: BrokerContext,
    pub notifier: Arc<DeliveryNotifier>,
    pub settings: ConnectionSettings,
    /// Flips to `true` when the broker stops accepting connections.
    pub shutdown: watch::Receiver<bool>,
}

/// Resolves once `true` is published on `shutdown`.
///
/// If the sender is dropped without publishing, this never resolves; the
/// owning task set is gone by then anyway.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Serves one upgraded connection until it closes, then runs cleanup.
///
/// `local` is the broker's side of the socket and `remote` the peer's.
/// Returns what cleanup removed.
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    local: Address,
    remote: Address,
    ctx: ConnectionContext,
) -> DeleteSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tx, mut rx) = ws.split();
    let mut session = Session::new(ctx.broker.clone(), local, remote);
    let mut shutdown = ctx.shutdown.clone();

    // Shutdown drops the loop at its current await point; cleanup below
    // still runs against the same session.
    let driven = tokio::select! {
        driven = AssertUnwindSafe(drive(&mut session, &mut tx, &mut rx, &ctx)).catch_unwind() => driven,
        () = shutdown_requested(&mut shutdown) => {
            info!("broker shutting down; ending session");
            Ok(Ok(()))
        }
    };
    match driven {
        Ok(Ok(())) => debug!("connection ended"),
        Ok(Err(e)) => debug!("connection ended by transport: {e:#}"),
        Err(_) => {
            error!("session panicked; cleaning up");
            let _ = send_json(&mut tx, &ErrorFrame::new("internal broker error")).await;
        }
    }

    let summary = session.close().await;
    info!(
        device = summary.device,
        mq = summary.mq,
        "connection closed"
    );

    if timeout(ctx.settings.close_timeout, tx.close()).await.is_err() {
        debug!("close handshake timed out");
    }
    summary
}

async fn drive<Tx, Rx>(
    session: &mut Session,
    tx: &mut Tx,
    rx: &mut Rx,
    ctx: &ConnectionContext,
) -> anyhow::Result<()>
where
    Tx: Sink<WsMessage, Error = WsError> + Unpin,
    Rx: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let settings = &ctx.settings;

    // ── Handshake ─────────────────────────────────────────────────────────────
    session.await_handshake();
    let frame = read_handshake(rx, settings.handshake_timeout).await;
    // A failed read still gets a reply; the session records it as unverified.
    let reply = session.complete_handshake(frame, unix_now()).await;
    send_json(tx, &reply).await?;
    if session.state() != SessionState::Authenticated {
        return Ok(());
    }

    // ── Authenticated loop ────────────────────────────────────────────────────
    let subscription = ctx.notifier.subscribe(session.remote().clone());

    let mut poll = interval(settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = interval(settings.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; the first ping goes out one interval in.
    // `poll` keeps its immediate tick so an existing backlog drains at once.
    keepalive.tick().await;
    let mut ping_sent: Option<Instant> = None;

    loop {
        let deliver = tokio::select! {
            frame = rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_text(session, tx, &ctx.notifier, &text).await?;
                    true
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    // Invalid UTF-8 becomes the empty frame.
                    let text = String::from_utf8(data).unwrap_or_default();
                    handle_text(session, tx, &ctx.notifier, &text).await?;
                    true
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    ping_sent = None;
                    false
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                // Pings are answered by tungstenite while reading.
                Some(Ok(_)) => false,
                Some(Err(e)) => return Err(e.into()),
            },
            _ = subscription.notified() => true,
            _ = poll.tick() => true,
            _ = keepalive.tick() => {
                match ping_sent {
                    Some(sent) if sent.elapsed() >= settings.pong_timeout => {
                        warn!("no pong within {:?}; dropping connection", settings.pong_timeout);
                        return Ok(());
                    }
                    // Still waiting on the last pong.
                    Some(_) => {}
                    None => {
                        tx.send(WsMessage::Ping(Vec::new())).await?;
                        ping_sent = Some(Instant::now());
                    }
                }
                false
            }
        };

        if deliver {
            drain(session, tx).await?;
        }
    }
}

/// Waits for the credential frame, skipping control frames.
async fn read_handshake<Rx>(rx: &mut Rx, limit: Duration) -> Result<String, HandshakeError>
where
    Rx: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let read = async {
        loop {
            match rx.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text),
                Some(Ok(WsMessage::Binary(data))) => {
                    return String::from_utf8(data)
                        .map_err(|e| HandshakeError::Transport(e.to_string()));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(HandshakeError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(HandshakeError::Transport(e.to_string())),
            }
        }
    };
    timeout(limit, read)
        .await
        .unwrap_or(Err(HandshakeError::Timeout(limit)))
}

async fn handle_text<Tx>(
    session: &mut Session,
    tx: &mut Tx,
    notifier: &DeliveryNotifier,
    text: &str,
) -> anyhow::Result<()>
where
    Tx: Sink<WsMessage, Error = WsError> + Unpin,
{
    // Anything unparseable gets the same silence as an empty frame.
    let inbound = Inbound::parse(text).unwrap_or_else(|e| {
        debug!("unreadable frame treated as empty: {e}");
        Inbound::Empty
    });

    match session.handle(inbound).await {
        Ok(response) => {
            for frame in response.frames {
                tx.send(WsMessage::Text(frame)).await?;
            }
            // Wake the destination's session instead of waiting for its poll.
            if let Some(destination) = response.stored_for {
                notifier.notify(&destination);
            }
        }
        Err(e) => {
            warn!("relay error: {e}");
            send_json(tx, &e.to_frame()).await?;
        }
    }
    Ok(())
}

/// Forwards queued messages until the queue for this peer is empty.
async fn drain<Tx>(session: &mut Session, tx: &mut Tx) -> anyhow::Result<()>
where
    Tx: Sink<WsMessage, Error = WsError> + Unpin,
{
    loop {
        match session.next_delivery().await {
            Ok(Some(frame)) => {
                debug!("delivering queued message");
                tx.send(WsMessage::Text(frame)).await?;
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("delivery failed: {e}");
                send_json(tx, &e.to_frame()).await?;
                return Ok(());
            }
        }
    }
}

async fn send_json<Tx, T>(tx: &mut Tx, value: &T) -> anyhow::Result<()>
where
    Tx: Sink<WsMessage, Error = WsError> + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(value)?;
    tx.send(WsMessage::Text(text)).await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
