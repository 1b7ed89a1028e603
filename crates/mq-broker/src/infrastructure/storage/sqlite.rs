//! SQLite store.
//!
//! Each logical table keeps the address key (`Address::key`) in an indexed
//! `receive` column and the JSON document in `body`.  Every trait method is a
//! single SQL statement, so the atomicity the sessions rely on comes from
//! SQLite itself:
//!
//! - dequeue is `DELETE … RETURNING` on the oldest matching row;
//! - a bounded enqueue is `INSERT … SELECT … WHERE (count) < limit`, and the
//!   relay's enqueue adds `EXISTS (directory row)` to the same statement;
//! - the directory upsert is `INSERT … ON CONFLICT DO UPDATE`.
//!
//! Directory filters are evaluated in Rust over the decoded documents.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use mq_core::{Address, Filter};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::application::store::{Store, StoreError};
use crate::domain::config::{DatabaseConfig, Table};
use crate::domain::records::{
    AuditId, AuditRecord, DeviceRecord, Document, QueuedMessage, StoreStats,
};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

/// Validated table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub queue: String,
    pub directory: String,
    pub log: String,
}

impl TableNames {
    /// Reads the table names from the database config.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTableName`] unless every name is a plain SQL
    /// identifier (`[A-Za-z_][A-Za-z0-9_]*`).
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, StoreError> {
        Ok(Self {
            queue: identifier(&config.queue_table)?,
            directory: identifier(&config.directory_table)?,
            log: identifier(&config.log_table)?,
        })
    }

    fn of(&self, table: Table) -> &str {
        match table {
            Table::Queue => &self.queue,
            Table::Directory => &self.directory,
            Table::Log => &self.log,
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            queue: "mq_data".to_string(),
            directory: "device_info".to_string(),
            log: "log_records".to_string(),
        }
    }
}

fn identifier(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

/// A [`Store`] backed by an SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    tables: TableNames,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path`.
    pub async fn open(path: &Path, tables: TableNames) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), "store database opened");

        let store = Self { pool, tables };
        store.create_schema().await?;
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub async fn open_in_memory(tables: TableNames) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool, tables };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        let TableNames {
            queue,
            directory,
            log,
        } = &self.tables;
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {queue} (id INTEGER PRIMARY KEY AUTOINCREMENT, receive TEXT NOT NULL, body TEXT NOT NULL)"
            ),
            format!("CREATE INDEX IF NOT EXISTS {queue}_receive ON {queue} (receive)"),
            format!(
                "CREATE TABLE IF NOT EXISTS {directory} (receive TEXT PRIMARY KEY, body TEXT NOT NULL)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {log} (id INTEGER PRIMARY KEY AUTOINCREMENT, receive TEXT NOT NULL, body TEXT NOT NULL)"
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0) as u64)
    }

    fn decode(&self, table: &str, body: &str) -> Result<Document, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
            table: table.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(document: &Document) -> Result<String, StoreError> {
        serde_json::to_string(document).map_err(|e| StoreError::Query(e.to_string()))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn enqueue(&self, message: QueuedMessage, limit: Option<u64>) -> Result<bool, StoreError> {
        let queue = &self.tables.queue;
        let key = message.receive.key();
        let body = Self::encode(&message.body)?;

        let result = match limit {
            None => {
                sqlx::query(&format!("INSERT INTO {queue} (receive, body) VALUES (?, ?)"))
                    .bind(key.as_str())
                    .bind(body.as_str())
                    .execute(&self.pool)
                    .await?
            }
            Some(limit) => {
                sqlx::query(&format!(
                    "INSERT INTO {queue} (receive, body) SELECT ?, ? \
                     WHERE (SELECT COUNT(*) FROM {queue} WHERE receive = ?) < ?"
                ))
                .bind(key.as_str())
                .bind(body.as_str())
                .bind(key.as_str())
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_for_known(
        &self,
        message: QueuedMessage,
        limit: Option<u64>,
    ) -> Result<bool, StoreError> {
        let TableNames {
            queue, directory, ..
        } = &self.tables;
        let key = message.receive.key();
        let body = Self::encode(&message.body)?;
        let limit = limit.map_or(i64::MAX, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let result = sqlx::query(&format!(
            "INSERT INTO {queue} (receive, body) SELECT ?, ? \
             WHERE EXISTS (SELECT 1 FROM {directory} WHERE receive = ?) \
             AND (SELECT COUNT(*) FROM {queue} WHERE receive = ?) < ?"
        ))
        .bind(key.as_str())
        .bind(body.as_str())
        .bind(key.as_str())
        .bind(key.as_str())
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dequeue_for(&self, address: &Address) -> Result<Option<Document>, StoreError> {
        let queue = &self.tables.queue;
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "DELETE FROM {queue} WHERE id = \
             (SELECT id FROM {queue} WHERE receive = ? ORDER BY id LIMIT 1) RETURNING body"
        ))
        .bind(address.key())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(body,)| self.decode(queue, &body)).transpose()
    }

    async fn purge_queue(&self, address: &Address) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE receive = ?", self.tables.queue))
            .bind(address.key())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_queued(&self, address: &Address) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE receive = ?",
            self.tables.queue
        ))
        .bind(address.key())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.max(0) as u64)
    }

    async fn upsert_device(&self, record: DeviceRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} (receive, body) VALUES (?, ?) \
             ON CONFLICT(receive) DO UPDATE SET body = excluded.body",
            self.tables.directory
        ))
        .bind(record.receive.key())
        .bind(Self::encode(&record.document)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device_exists(&self, address: &Address) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {} WHERE receive = ?",
            self.tables.directory
        ))
        .bind(address.key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn delete_devices(&self, address: &Address) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE receive = ?",
            self.tables.directory
        ))
        .bind(address.key())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_devices(&self, filter: &Filter) -> Result<u64, StoreError> {
        if filter.is_empty() {
            return self.count(&self.tables.directory).await;
        }
        Ok(self.find_devices(filter).await?.len() as u64)
    }

    async fn find_devices(&self, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let directory = &self.tables.directory;
        let rows: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT body FROM {directory} ORDER BY receive"))
                .fetch_all(&self.pool)
                .await?;

        let mut matches = Vec::new();
        for (body,) in rows {
            let document = self.decode(directory, &body)?;
            if filter.matches_document(&document) {
                matches.push(document);
            }
        }
        Ok(matches)
    }

    async fn append_audit(&self, record: AuditRecord) -> Result<AuditId, StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (receive, body) VALUES (?, ?)",
            self.tables.log
        ))
        .bind(record.receive.key())
        .bind(Self::encode(&record.document)?)
        .execute(&self.pool)
        .await?;
        Ok(AuditId(result.last_insert_rowid()))
    }

    async fn update_audit(&self, id: AuditId, record: AuditRecord) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET receive = ?, body = ? WHERE id = ?",
            self.tables.log
        ))
        .bind(record.receive.key())
        .bind(Self::encode(&record.document)?)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AuditNotFound(id.0));
        }
        Ok(())
    }

    async fn reset(&self, tables: &[Table]) -> Result<(), StoreError> {
        for table in tables {
            let name = self.tables.of(*table);
            sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                .execute(&self.pool)
                .await?;
            info!(table = name, "table dropped");
        }
        self.create_schema().await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            queued: self.count(&self.tables.queue).await?,
            devices: self.count(&self.tables.directory).await?,
            audit: self.count(&self.tables.log).await?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
