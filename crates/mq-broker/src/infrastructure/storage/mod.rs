//! Storage backends and the startup factory.
//!
//! - **`memory`** – Tables in process memory; nothing survives a restart.
//! - **`sqlite`** – Tables in an SQLite file under the configured directory.

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::application::store::Store;
use crate::domain::config::{DatabaseConfig, StoreLocation, Table};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, TableNames};

/// Opens the backend named by `config.address` and applies the startup
/// reset.
///
/// # Errors
///
/// Returns an error if the address is unsupported, a table name is invalid,
/// the database cannot be opened, or the reset fails.
pub async fn open_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn Store>> {
    let location = config.location()?;
    let tables = TableNames::from_config(config)?;

    let store: Arc<dyn Store> = match &location {
        StoreLocation::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreLocation::Sqlite(path) => {
            if config.reset.drop_database {
                drop_database(path)?;
            }
            let store = SqliteStore::open(path, tables)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Arc::new(store)
        }
    };

    let to_reset = tables_to_reset(config);
    if !to_reset.is_empty() {
        store
            .reset(&to_reset)
            .await
            .context("failed to reset tables")?;
        info!(tables = ?config.reset.drop_tables, "startup reset applied");
    }

    Ok(store)
}

/// Maps the configured `drop_tables` names to tables, skipping unknown names.
pub fn tables_to_reset(config: &DatabaseConfig) -> Vec<Table> {
    let mut tables = Vec::new();
    for name in &config.reset.drop_tables {
        match config.table_named(name) {
            Some(table) if !tables.contains(&table) => tables.push(table),
            Some(_) => {}
            None => warn!(table = %name, "reset names an unknown table; ignored"),
        }
    }
    tables
}

/// Deletes the database file and its WAL side files.
fn drop_database(path: &Path) -> anyhow::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let file = format!("{}{suffix}", path.display());
        match std::fs::remove_file(&file) {
            Ok(()) => info!(file = %file, "database file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("failed to remove {file}")),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::records::QueuedMessage;
    use mq_core::Address;
    use serde_json::json;

    fn sqlite_config(dir: &Path) -> DatabaseConfig {
        DatabaseConfig {
            address: format!("sqlite://{}", dir.display()),
            ..DatabaseConfig::default()
        }
    }

    fn message() -> QueuedMessage {
        let body = json!({"send": ["a", 1], "receive": ["b", 2]});
        QueuedMessage::from_body(body.as_object().cloned().unwrap()).unwrap()
    }

    #[test]
    fn test_tables_to_reset_maps_names() {
        let mut config = DatabaseConfig::default();
        assert_eq!(
            tables_to_reset(&config),
            vec![Table::Queue, Table::Directory, Table::Log]
        );

        config.reset.drop_tables = vec!["log_records".into(), "nope".into(), "log_records".into()];
        assert_eq!(tables_to_reset(&config), vec![Table::Log]);
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let config = DatabaseConfig {
            address: "memory://".to_string(),
            ..DatabaseConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_unsupported_address_is_rejected() {
        let config = DatabaseConfig {
            address: "mongodb://localhost:27017".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(open_store(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_startup_reset_clears_previous_run() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let mut config = sqlite_config(dir.path());
        config.reset.drop_tables.clear();
        let first = open_store(&config).await.unwrap();
        first.enqueue(message(), None).await.unwrap();
        drop(first);

        // Act
        config.reset.drop_tables = vec!["mq_data".to_string()];
        let second = open_store(&config).await.unwrap();

        // Assert
        assert_eq!(second.count_queued(&Address::new("b", 2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_without_reset_rows_survive() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sqlite_config(dir.path());
        config.reset.drop_tables.clear();

        let first = open_store(&config).await.unwrap();
        first.enqueue(message(), None).await.unwrap();
        drop(first);

        let second = open_store(&config).await.unwrap();
        assert_eq!(second.count_queued(&Address::new("b", 2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_database_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mq_server.db");
        std::fs::write(&path, b"not a database").unwrap();

        drop_database(&path).unwrap();

        assert!(!path.exists());
    }
}
