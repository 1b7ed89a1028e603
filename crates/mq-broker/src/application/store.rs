//! The storage port.
//!
//! Sessions never share in-process state; everything they coordinate on goes
//! through a [`Store`].  Each method is a single atomic operation on the
//! backend.  In particular [`Store::dequeue_for`] finds and deletes in one
//! step, so two sessions can never both receive the same queued message.

use async_trait::async_trait;
use mq_core::{Address, Filter};
use thiserror::Error;

use crate::domain::config::Table;
use crate::domain::records::{
    AuditId, AuditRecord, DeviceRecord, Document, QueuedMessage, StoreStats,
};

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    /// A stored document could not be decoded.
    #[error("corrupt document in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    /// A configured table name is not a plain SQL identifier.
    #[error("invalid table name '{0}'")]
    InvalidTableName(String),

    /// An audit row id that the backend never issued.
    #[error("audit row {0} not found")]
    AuditNotFound(i64),
}

/// Queue, directory and audit log operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // ── Queue ────────────────────────────────────────────────────────────────

    /// Stores `message` for its destination.
    ///
    /// With `limit = Some(n)` the insert only happens while fewer than `n`
    /// messages are pending for that destination; the check and the insert
    /// are one operation.  Returns whether the message was stored.
    async fn enqueue(&self, message: QueuedMessage, limit: Option<u64>)
        -> Result<bool, StoreError>;

    /// Like [`Store::enqueue`], but only while the destination has a
    /// directory entry.  The directory check, the limit check and the insert
    /// are one operation, so a message can never land after its
    /// destination's cleanup ran.
    async fn enqueue_for_known(
        &self,
        message: QueuedMessage,
        limit: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Removes and returns one message addressed to `address`.
    async fn dequeue_for(&self, address: &Address) -> Result<Option<Document>, StoreError>;

    /// Deletes every message addressed to `address`, returning how many.
    async fn purge_queue(&self, address: &Address) -> Result<u64, StoreError>;

    async fn count_queued(&self, address: &Address) -> Result<u64, StoreError>;

    // ── Directory ────────────────────────────────────────────────────────────

    /// Inserts or replaces the entry for `record.receive`.
    async fn upsert_device(&self, record: DeviceRecord) -> Result<(), StoreError>;

    async fn device_exists(&self, address: &Address) -> Result<bool, StoreError>;

    /// Deletes the entries for `address`, returning how many existed.
    async fn delete_devices(&self, address: &Address) -> Result<u64, StoreError>;

    async fn count_devices(&self, filter: &Filter) -> Result<u64, StoreError>;

    async fn find_devices(&self, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    // ── Audit log ────────────────────────────────────────────────────────────

    async fn append_audit(&self, record: AuditRecord) -> Result<AuditId, StoreError>;

    /// Replaces the document of an existing audit row.
    async fn update_audit(&self, id: AuditId, record: AuditRecord) -> Result<(), StoreError>;

    // ── Administration ───────────────────────────────────────────────────────

    /// Empties the given tables.
    async fn reset(&self, tables: &[Table]) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
