//! Per-connection state machine.
//!
//! A [`Session`] holds everything the broker knows about one connection and
//! decides what to do with each frame.  It never touches the socket: the
//! connection driver in `infrastructure::connection` reads frames, hands them
//! to the session and writes back whatever the session returns.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──► HandshakeWait ──► Authenticated ──► Closed
//!                      │                               ▲
//!                      └──────────► Rejected ──────────┘
//! ```
//!
//! - `Connecting`: the WebSocket upgrade succeeded.
//! - `HandshakeWait`: waiting for the credential frame.
//! - `Authenticated`: the TOTP code matched; the peer is in the directory and
//!   may submit messages and queries.
//! - `Rejected`: the handshake failed; the peer got an unverified reply and
//!   the connection is about to close.
//! - `Closed`: cleanup ran.  The peer's directory row and queued messages are
//!   gone and the audit row carries the `delete` summary.

use std::sync::Arc;
use std::time::Duration;

use mq_core::protocol::messages::{count_frame, swap_endpoints, RECEIVE_KEY};
use mq_core::{
    verify, Address, ErrorFrame, Filter, FilterError, FrameError, HandshakeReply,
    HandshakeRequest, Inbound, StatusReply, Verification, VerifyError,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::store::{Store, StoreError};
use crate::domain::config::PolicyConfig;
use crate::domain::records::{AuditId, AuditRecord, DeleteSummary, DeviceRecord, QueuedMessage};

// ── Error types ───────────────────────────────────────────────────────────────

/// Why a handshake produced no verified result.
///
/// Every variant ends up in the `message` field of an unverified reply.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before the handshake")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed handshake: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no secret supplied")]
    MissingSecret,

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Failures while serving an authenticated peer.
///
/// None of these end the session; the driver reports them to the peer as an
/// [`ErrorFrame`] and carries on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid query: {0}")]
    Filter(#[from] FilterError),

    #[error("query field '{0}' is not allowed")]
    FieldNotAllowed(String),

    #[error("undeliverable message: {0}")]
    Frame(#[from] FrameError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),
}

impl RelayError {
    /// The frame sent to the peer for this error.
    pub fn to_frame(&self) -> ErrorFrame {
        ErrorFrame::new(self)
    }
}

// ── Shared context ────────────────────────────────────────────────────────────

/// Queue bound and query allow-list applied to every session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPolicy {
    /// Maximum pending messages per destination; `None` is unbounded.
    pub queue_limit: Option<u64>,
    /// Field paths a query may reference; empty allows any.
    pub query_fields: Vec<String>,
}

impl From<&PolicyConfig> for SessionPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            queue_limit: config.queue_limit(),
            query_fields: config.query_fields.clone(),
        }
    }
}

impl SessionPolicy {
    fn check_filter(&self, filter: &Filter) -> Result<(), RelayError> {
        if self.query_fields.is_empty() {
            return Ok(());
        }
        match filter
            .field_paths()
            .into_iter()
            .find(|path| !self.query_fields.iter().any(|allowed| allowed == path))
        {
            Some(path) => Err(RelayError::FieldNotAllowed(path.to_string())),
            None => Ok(()),
        }
    }
}

/// What every session shares: the store and the policy.
#[derive(Clone)]
pub struct BrokerContext {
    pub store: Arc<dyn Store>,
    pub policy: Arc<SessionPolicy>,
}

impl BrokerContext {
    pub fn new(store: Arc<dyn Store>, policy: SessionPolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeWait,
    Authenticated,
    Rejected,
    Closed,
}

/// Frames to send back after handling one inbound frame.
#[derive(Debug, Default, PartialEq)]
pub struct Response {
    /// Text frames, in order.
    pub frames: Vec<String>,
    /// Set when a message was queued, so the destination can be woken.
    pub stored_for: Option<Address>,
}

pub struct Session {
    ctx: BrokerContext,
    /// The broker's side of the connection (`send`).
    local: Address,
    /// The peer's side of the connection (`receive`).
    remote: Address,
    state: SessionState,
    audit: Option<(AuditId, AuditRecord)>,
    summary: Option<DeleteSummary>,
}

impl Session {
    pub fn new(ctx: BrokerContext, local: Address, remote: Address) -> Self {
        Self {
            ctx,
            local,
            remote,
            state: SessionState::Connecting,
            audit: None,
            summary: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local(&self) -> &Address {
        &self.local
    }

    pub fn remote(&self) -> &Address {
        &self.remote
    }

    /// Marks the session as waiting for the credential frame.
    pub fn await_handshake(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::HandshakeWait;
        }
    }

    /// Verifies the credential frame (or the error that replaced it) and
    /// records the outcome.
    ///
    /// A verified peer is upserted into the directory before the reply is
    /// returned.  Every outcome is appended to the audit log.  Failures of
    /// any kind produce an unverified reply with a `message`; they never
    /// surface as errors.
    pub async fn complete_handshake(
        &mut self,
        frame: Result<String, HandshakeError>,
        now: u64,
    ) -> HandshakeReply {
        self.await_handshake();

        let mut reply = match frame.and_then(|text| verify_frame(&text, now)) {
            Ok(verification) => {
                HandshakeReply::computed(verification, self.local.clone(), self.remote.clone())
            }
            Err(e) => self.rejection(e),
        };

        if reply.verified() {
            if let Err(e) = self.register(&reply).await {
                warn!(peer = %self.remote, "directory upsert failed: {e}");
                reply = self.rejection(e);
            }
        }

        match AuditRecord::from_reply(&reply) {
            Ok(record) => match self.ctx.store.append_audit(record.clone()).await {
                Ok(id) => self.audit = Some((id, record)),
                Err(e) => warn!(peer = %self.remote, "audit append failed: {e}"),
            },
            Err(e) => warn!(peer = %self.remote, "audit record encoding failed: {e}"),
        }

        self.state = if reply.verified() {
            SessionState::Authenticated
        } else {
            SessionState::Rejected
        };
        info!(
            peer = %self.remote,
            verified = reply.verified(),
            message = reply.message.as_deref().unwrap_or(""),
            "handshake complete"
        );
        reply
    }

    fn rejection(&self, error: impl std::fmt::Display) -> HandshakeReply {
        HandshakeReply::failed(
            self.local.clone(),
            self.remote.clone(),
            format!("not verified: {error}"),
        )
    }

    async fn register(&self, reply: &HandshakeReply) -> Result<(), RelayError> {
        let record = DeviceRecord::from_reply(reply)?;
        self.ctx.store.upsert_device(record).await?;
        Ok(())
    }

    /// Handles one frame from an authenticated peer.
    ///
    /// # Errors
    ///
    /// Bad filters, disallowed query fields and store failures are returned
    /// as [`RelayError`]; the caller reports them and keeps the session open.
    pub async fn handle(&mut self, inbound: Inbound) -> Result<Response, RelayError> {
        self.require_authenticated()?;
        match inbound {
            Inbound::Empty => Ok(Response::default()),
            Inbound::Query(document) => self.query(&document).await,
            Inbound::Message(message) => self.submit(message).await,
        }
    }

    async fn query(&self, document: &Value) -> Result<Response, RelayError> {
        let filter = Filter::parse(document)?;
        self.ctx.policy.check_filter(&filter)?;

        let count = self.ctx.store.count_devices(&filter).await?;
        let records = self.ctx.store.find_devices(&filter).await?;
        debug!(peer = %self.remote, count, "directory query");

        let mut frames = Vec::with_capacity(records.len() + 1);
        frames.push(count_frame(count));
        for record in records {
            frames.push(serde_json::to_string(&record)?);
        }
        Ok(Response {
            frames,
            stored_for: None,
        })
    }

    async fn submit(&self, message: Map<String, Value>) -> Result<Response, RelayError> {
        let stored_for = match Address::from_field(&message, RECEIVE_KEY) {
            Ok(receive) => self.store_if_known(receive, &message).await?,
            Err(e) => {
                debug!(peer = %self.remote, "message rejected: {e}");
                None
            }
        };

        let status = StatusReply::for_message(&message, stored_for.is_some());
        Ok(Response {
            frames: vec![serde_json::to_string(&status)?],
            stored_for,
        })
    }

    async fn store_if_known(
        &self,
        receive: Address,
        message: &Map<String, Value>,
    ) -> Result<Option<Address>, RelayError> {
        let queued = QueuedMessage {
            receive: receive.clone(),
            body: message.clone(),
        };
        // Checking the directory separately would race the destination's
        // cleanup and could leave an orphaned row.
        let stored = self
            .ctx
            .store
            .enqueue_for_known(queued, self.ctx.policy.queue_limit)
            .await?;
        if stored {
            debug!(peer = %self.remote, to = %receive, "message queued");
            Ok(Some(receive))
        } else {
            debug!(peer = %self.remote, to = %receive, "destination unknown or queue full");
            Ok(None)
        }
    }

    /// Takes one message addressed to this peer off the queue and returns it
    /// with `send` and `receive` swapped.
    ///
    /// # Errors
    ///
    /// A store failure, or a stored message without both endpoint fields.
    /// In the latter case the message has already left the queue.
    pub async fn next_delivery(&mut self) -> Result<Option<String>, RelayError> {
        self.require_authenticated()?;
        let Some(mut message) = self.ctx.store.dequeue_for(&self.remote).await? else {
            return Ok(None);
        };
        swap_endpoints(&mut message)?;
        Ok(Some(serde_json::to_string(&message)?))
    }

    /// Purges this peer from the directory and the queue and finalizes its
    /// audit row.
    ///
    /// Runs for every session, verified or not.  Store failures are logged
    /// and counted as nothing removed.  Calling it again returns the first
    /// summary without touching the store.
    pub async fn close(&mut self) -> DeleteSummary {
        if let Some(summary) = self.summary {
            return summary;
        }
        let store = &self.ctx.store;

        // Directory first: once the row is gone no new message can be queued
        // for this address, so the purge below leaves the queue empty.
        let device = match store.delete_devices(&self.remote).await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(peer = %self.remote, "directory cleanup failed: {e}");
                false
            }
        };
        let mq = match store.purge_queue(&self.remote).await {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %self.remote, "queue cleanup failed: {e}");
                0
            }
        };
        let summary = DeleteSummary { device, mq };

        let written = match self.audit.take() {
            Some((id, record)) => store.update_audit(id, record.with_delete(summary)).await,
            None => {
                let record = AuditRecord::unverified(&self.local, &self.remote).with_delete(summary);
                store.append_audit(record).await.map(|_| ())
            }
        };
        if let Err(e) = written {
            warn!(peer = %self.remote, "audit update failed: {e}");
        }

        self.state = SessionState::Closed;
        self.summary = Some(summary);
        summary
    }

    fn require_authenticated(&self) -> Result<(), RelayError> {
        match self.state {
            SessionState::Authenticated => Ok(()),
            other => Err(RelayError::InvalidState(other)),
        }
    }
}

fn verify_frame(text: &str, now: u64) -> Result<Verification, HandshakeError> {
    let request: HandshakeRequest = serde_json::from_str(text)?;
    verify(&request.into_params(), now)?.ok_or(HandshakeError::MissingSecret)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
