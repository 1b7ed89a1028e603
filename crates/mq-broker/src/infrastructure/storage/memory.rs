//! In-process store.
//!
//! Used for `memory://` deployments and throughout the tests.  All tables
//! sit behind one `tokio::sync::Mutex`, so every trait method is a single
//! critical section and therefore atomic with respect to other sessions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mq_core::{Address, Filter};
use tokio::sync::Mutex;

use crate::application::store::{Store, StoreError};
use crate::domain::config::Table;
use crate::domain::records::{
    AuditId, AuditRecord, DeviceRecord, Document, QueuedMessage, StoreStats,
};

#[derive(Debug, Default)]
struct Tables {
    queue: Vec<QueuedMessage>,
    devices: BTreeMap<Address, Document>,
    /// Row `i` has id `i + 1`.
    audit: Vec<AuditRecord>,
}

/// A [`Store`] backed by in-process collections.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit log, oldest first.
    pub async fn audit_rows(&self) -> Vec<Document> {
        let tables = self.tables.lock().await;
        tables.audit.iter().map(|r| r.document.clone()).collect()
    }

    fn push_bounded(tables: &mut Tables, message: QueuedMessage, limit: Option<u64>) -> bool {
        if let Some(limit) = limit {
            let pending = tables
                .queue
                .iter()
                .filter(|m| m.receive == message.receive)
                .count() as u64;
            if pending >= limit {
                return false;
            }
        }
        tables.queue.push(message);
        true
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(&self, message: QueuedMessage, limit: Option<u64>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(Self::push_bounded(&mut tables, message, limit))
    }

    async fn enqueue_for_known(
        &self,
        message: QueuedMessage,
        limit: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.devices.contains_key(&message.receive) {
            return Ok(false);
        }
        Ok(Self::push_bounded(&mut tables, message, limit))
    }

    async fn dequeue_for(&self, address: &Address) -> Result<Option<Document>, StoreError> {
        let mut tables = self.tables.lock().await;
        let position = tables.queue.iter().position(|m| &m.receive == address);
        Ok(position.map(|i| tables.queue.remove(i).body))
    }

    async fn purge_queue(&self, address: &Address) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.queue.len();
        tables.queue.retain(|m| &m.receive != address);
        Ok((before - tables.queue.len()) as u64)
    }

    async fn count_queued(&self, address: &Address) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.queue.iter().filter(|m| &m.receive == address).count() as u64)
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.devices.insert(record.receive, record.document);
        Ok(())
    }

    async fn device_exists(&self, address: &Address) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.devices.contains_key(address))
    }

    async fn delete_devices(&self, address: &Address) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(u64::from(tables.devices.remove(address).is_some()))
    }

    async fn count_devices(&self, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self.find_devices(filter).await?.len() as u64)
    }

    async fn find_devices(&self, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .devices
            .values()
            .filter(|doc| filter.matches_document(doc))
            .cloned()
            .collect())
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<AuditId, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.audit.push(record);
        Ok(AuditId(tables.audit.len() as i64))
    }

    async fn update_audit(&self, id: AuditId, record: AuditRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let slot = usize::try_from(id.0 - 1)
            .ok()
            .and_then(|i| tables.audit.get_mut(i))
            .ok_or(StoreError::AuditNotFound(id.0))?;
        *slot = record;
        Ok(())
    }

    async fn reset(&self, tables_to_reset: &[Table]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for table in tables_to_reset {
            match table {
                Table::Queue => tables.queue.clear(),
                Table::Directory => tables.devices.clear(),
                Table::Log => tables.audit.clear(),
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let tables = self.tables.lock().await;
        Ok(StoreStats {
            queued: tables.queue.len() as u64,
            devices: tables.devices.len() as u64,
            audit: tables.audit.len() as u64,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
