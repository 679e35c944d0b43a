//! Points ledger service and balance projection.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerEntry};
use crate::interfaces::{
    BalanceSnapshot, LedgerStore, LedgerWrite, NewLedgerEntry, StorageError,
};
use crate::utils::Clock;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors surfaced by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Points amount must be positive, got {points}")]
    InvalidAmount { points: i64 },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Append-only points ledger for (customer, merchant) pairs.
///
/// The ledger is the source of truth for balance; no operation here updates
/// or deletes an entry. Writes carrying an `external_ref` are idempotent: a
/// replay returns the prior entry unchanged, including under a
/// unique-constraint race.
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Credit earned points. `points` must be positive.
    pub async fn record_earn(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        points: i64,
        external_ref: Option<String>,
        note: Option<String>,
    ) -> Result<LedgerEntry> {
        self.record(
            customer_id,
            merchant_id,
            EntryKind::Earn,
            points,
            external_ref,
            None,
            note,
        )
        .await
    }

    /// Debit redeemed points. `points` is a positive magnitude, stored as a
    /// negative delta.
    pub async fn record_redeem(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        points: i64,
        external_ref: Option<String>,
        redemption_id: Option<Uuid>,
        note: Option<String>,
    ) -> Result<LedgerEntry> {
        self.record(
            customer_id,
            merchant_id,
            EntryKind::Redeem,
            points,
            external_ref,
            redemption_id,
            note,
        )
        .await
    }

    /// Debit refunded points. Same contract as `record_redeem`.
    pub async fn record_refund(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        points: i64,
        external_ref: Option<String>,
        redemption_id: Option<Uuid>,
        note: Option<String>,
    ) -> Result<LedgerEntry> {
        self.record(
            customer_id,
            merchant_id,
            EntryKind::Refund,
            points,
            external_ref,
            redemption_id,
            note,
        )
        .await
    }

    /// Current balance: the signed sum of all entries for the pair.
    pub async fn balance(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<i64> {
        Ok(self.store.sum_points(customer_id, merchant_id).await?)
    }

    async fn record(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        kind: EntryKind,
        points: i64,
        external_ref: Option<String>,
        redemption_id: Option<Uuid>,
        note: Option<String>,
    ) -> Result<LedgerEntry> {
        if points <= 0 {
            return Err(LedgerError::InvalidAmount { points });
        }

        let signed = match kind {
            EntryKind::Earn => points,
            EntryKind::Redeem | EntryKind::Refund => -points,
        };

        let entry = NewLedgerEntry {
            id: Uuid::new_v4(),
            customer_id,
            merchant_id,
            kind,
            points: signed,
            external_ref,
            redemption_id,
            note,
            created_at: self.clock.now(),
        };

        match self.store.append(entry).await? {
            LedgerWrite::Fresh(entry) => {
                debug!(
                    entry_id = %entry.id,
                    kind = entry.kind.as_str(),
                    points = entry.points,
                    "Ledger entry written"
                );
                Ok(entry)
            }
            LedgerWrite::Existing(entry) => {
                debug!(
                    entry_id = %entry.id,
                    kind = entry.kind.as_str(),
                    "Ledger write replayed, returning winner"
                );
                Ok(entry)
            }
            LedgerWrite::InsufficientBalance {
                required,
                available,
            } => Err(LedgerError::InsufficientBalance {
                required,
                available,
            }),
        }
    }
}

/// Read-side balance projection.
///
/// The cached balance is only ever recomputed from the ledger, never
/// independently decremented, so it cannot drift from the entries.
pub struct BalanceProjector {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl BalanceProjector {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Live balance, summed from the ledger.
    pub async fn balance(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<i64> {
        Ok(self.store.sum_points(customer_id, merchant_id).await?)
    }

    /// Recompute the pair's balance and persist it as a snapshot.
    pub async fn refresh(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<BalanceSnapshot> {
        Ok(self
            .store
            .refresh_snapshot(customer_id, merchant_id, self.clock.now())
            .await?)
    }

    /// The cached snapshot, recomputing if none has been taken yet.
    pub async fn cached(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<BalanceSnapshot> {
        match self.store.snapshot(customer_id, merchant_id).await? {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh(customer_id, merchant_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::sqlite::test_pool;
    use crate::storage::SqliteLedgerStore;
    use crate::utils::SystemClock;

    async fn ledger() -> PointsLedger {
        let store = Arc::new(SqliteLedgerStore::new(test_pool().await));
        PointsLedger::new(store, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn earn_then_balance() {
        let ledger = ledger().await;
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        ledger
            .record_earn(customer, merchant, 120, None, None)
            .await
            .unwrap();
        ledger
            .record_earn(customer, merchant, 80, None, None)
            .await
            .unwrap();
        assert_eq!(ledger.balance(customer, merchant).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let ledger = ledger().await;
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        for points in [0, -5] {
            let err = ledger
                .record_earn(customer, merchant, points, None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount { .. }));
        }
    }

    #[tokio::test]
    async fn redeem_stores_negative_delta() {
        let ledger = ledger().await;
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        ledger
            .record_earn(customer, merchant, 300, None, None)
            .await
            .unwrap();
        let entry = ledger
            .record_redeem(customer, merchant, 100, None, None, None)
            .await
            .unwrap();
        assert_eq!(entry.points, -100);
        assert_eq!(ledger.balance(customer, merchant).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn duplicate_external_ref_returns_same_identity() {
        let ledger = ledger().await;
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        let first = ledger
            .record_earn(
                customer,
                merchant,
                200,
                Some("square:payment:p9".into()),
                None,
            )
            .await
            .unwrap();
        let second = ledger
            .record_earn(
                customer,
                merchant,
                200,
                Some("square:payment:p9".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(ledger.balance(customer, merchant).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn redeem_beyond_balance_fails() {
        let ledger = ledger().await;
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        ledger
            .record_earn(customer, merchant, 50, None, None)
            .await
            .unwrap();
        let err = ledger
            .record_redeem(customer, merchant, 80, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                required: 80,
                available: 50
            }
        ));
        assert_eq!(ledger.balance(customer, merchant).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn projector_matches_ledger_sum() {
        let store = Arc::new(SqliteLedgerStore::new(test_pool().await));
        let ledger = PointsLedger::new(store.clone(), Arc::new(SystemClock));
        let projector = BalanceProjector::new(store, Arc::new(SystemClock));
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        ledger
            .record_earn(customer, merchant, 75, None, None)
            .await
            .unwrap();
        assert_eq!(projector.balance(customer, merchant).await.unwrap(), 75);
        assert_eq!(projector.cached(customer, merchant).await.unwrap().balance, 75);

        ledger
            .record_earn(customer, merchant, 25, None, None)
            .await
            .unwrap();
        assert_eq!(projector.refresh(customer, merchant).await.unwrap().balance, 100);
    }
}
