//! Store and collaborator interfaces.
//!
//! The core touches mutable state only through these traits; correctness
//! under concurrency comes from each implementation's transactional
//! guarantees and unique constraints, not from in-process locks.

mod catalog;
mod event_store;
mod ledger_store;
mod redemption_store;

pub use catalog::{Directory, RewardCatalog};
pub use event_store::{IngestOutcome, NewWebhookEvent, WebhookEventStore};
pub use ledger_store::{BalanceSnapshot, LedgerStore, LedgerWrite, NewLedgerEntry};
pub use redemption_store::{ConfirmOutcome, InsertOutcome, NewRedemption, RedemptionStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl StorageError {
    pub fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        StorageError::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}
