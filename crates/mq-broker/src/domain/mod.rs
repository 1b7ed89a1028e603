//! Domain layer for mq-broker.
//!
//! Pure types with no I/O beyond reading and writing the config file:
//! the TOML configuration schema and the documents kept by the store.

pub mod config;
pub mod records;

pub use config::{BrokerConfig, ConfigError, ConfigSource, StoreLocation, Table};
pub use records::{
    AuditId, AuditRecord, DeleteSummary, DeviceRecord, Document, QueuedMessage, StoreStats,
};
