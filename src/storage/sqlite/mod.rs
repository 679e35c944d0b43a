//! SQLite implementations of storage interfaces.
//!
//! All queries are built with sea-query. Multi-statement transactions use
//! BEGIN IMMEDIATE to acquire the write lock upfront, preventing deadlocks
//! when concurrent DEFERRED transactions race to upgrade from shared to
//! exclusive.

mod catalog;
mod event_store;
mod ledger_store;
mod redemption_store;

pub use catalog::SqliteCatalog;
pub use event_store::SqliteWebhookEventStore;
pub use ledger_store::SqliteLedgerStore;
pub use redemption_store::SqliteRedemptionStore;

use sqlx::SqlitePool;

use crate::interfaces::Result;
use crate::storage::schema;

/// Create all tables and indexes if they do not exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in [
        schema::CREATE_LEDGER_TABLES,
        schema::CREATE_REDEMPTIONS_TABLE,
        schema::CREATE_WEBHOOK_EVENTS_TABLE,
        schema::CREATE_CATALOG_TABLES,
    ] {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }
    Ok(())
}

/// Whether a sqlx error is a unique-constraint violation.
///
/// Conflicts on unique indexes are expected control flow here (idempotent
/// replays, code collisions), not failures.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_schema(&pool).await.expect("schema");
    pool
}
