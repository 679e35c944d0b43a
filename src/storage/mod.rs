//! Storage implementations.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

use crate::config::StorageConfig;
use crate::interfaces::{LedgerStore, RedemptionStore, Result, StorageError, WebhookEventStore};

pub mod schema;
pub mod sqlite;

pub use sqlite::{
    SqliteCatalog, SqliteLedgerStore, SqliteRedemptionStore, SqliteWebhookEventStore,
};

/// The store handles a deployment runs against.
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub redemptions: Arc<dyn RedemptionStore>,
    pub events: Arc<dyn WebhookEventStore>,
    pub catalog: Arc<SqliteCatalog>,
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Stores> {
    info!(storage = %config.storage_type, path = %config.path, "Initializing storage");

    match config.storage_type.as_str() {
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::corrupt("sqlite", e.to_string()))?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;
            sqlite::init_schema(&pool).await?;

            Ok(Stores {
                ledger: Arc::new(SqliteLedgerStore::new(pool.clone())),
                redemptions: Arc::new(SqliteRedemptionStore::new(pool.clone())),
                events: Arc::new(SqliteWebhookEventStore::new(pool.clone())),
                catalog: Arc::new(SqliteCatalog::new(pool)),
            })
        }
        other => Err(StorageError::corrupt(
            "config",
            format!("unknown storage type: {other}"),
        )),
    }
}

/// Render a timestamp in the canonical column format.
///
/// RFC 3339 with microsecond precision in UTC; the fixed width keeps string
/// comparison equivalent to chronological comparison for the deadline
/// predicates in SQL.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp column back.
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Parse an optional timestamp column back.
pub fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}
