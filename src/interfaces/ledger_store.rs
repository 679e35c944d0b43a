//! Ledger persistence interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerEntry};

use super::Result;

/// Fields for a ledger entry about to be written.
///
/// `points` is the signed delta as it will be stored: positive for earn,
/// negative for redeem/refund. The id and `created_at` are assigned by the
/// caller so that an idempotent replay can be compared against the winner.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub kind: EntryKind,
    pub points: i64,
    pub external_ref: Option<String>,
    pub redemption_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an append attempt.
#[derive(Debug, Clone)]
pub enum LedgerWrite {
    /// The entry was written.
    Fresh(LedgerEntry),
    /// An entry with the same (merchant, kind, external_ref) already
    /// existed; the winner is returned unchanged.
    Existing(LedgerEntry),
    /// A debit would have taken the pair's balance negative. Checked inside
    /// the same transaction as the write, never clamped after.
    InsufficientBalance { required: i64, available: i64 },
}

/// A denormalized balance recomputed from the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub balance: i64,
    pub computed_at: DateTime<Utc>,
}

/// Interface for the append-only points ledger.
///
/// Entries are immutable once written; nothing in this interface updates or
/// deletes a row.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append an entry.
    ///
    /// When `external_ref` is present the write is idempotent: a
    /// unique-constraint conflict on (merchant, kind, external_ref) is
    /// absorbed by reading back and returning the existing entry. Debits
    /// (negative `points`) are balance-checked in the same transaction.
    async fn append(&self, entry: NewLedgerEntry) -> Result<LedgerWrite>;

    /// Signed sum of all entries for the pair.
    async fn sum_points(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<i64>;

    /// All entries for the pair, oldest first.
    async fn entries_for_pair(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Vec<LedgerEntry>>;

    /// Recompute the pair's balance and persist it as a snapshot.
    async fn refresh_snapshot(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        computed_at: DateTime<Utc>,
    ) -> Result<BalanceSnapshot>;

    /// Read the cached snapshot, if one has been computed.
    async fn snapshot(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Option<BalanceSnapshot>>;
}
