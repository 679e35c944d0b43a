//! Redemption persistence interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Redemption, RedemptionStatus};

use super::{NewLedgerEntry, Result};

/// Fields for a redemption about to be created.
#[derive(Debug, Clone)]
pub struct NewRedemption {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub reward_id: Uuid,
    pub token: String,
    pub pin: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a redemption insert attempt.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Redemption),
    /// The token or PIN collided with an existing redemption. The caller
    /// regenerates and retries up to its attempt bound.
    CodeCollision,
}

/// Outcome of a confirm-and-debit attempt.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// The transition and the debit committed as one unit.
    Confirmed(Redemption),
    /// The redemption was already confirmed; the existing record is
    /// returned unchanged and no second debit happened.
    AlreadyConfirmed(Redemption),
    /// Balance dropped below the cost since creation; nothing was written.
    InsufficientBalance { required: i64, available: i64 },
    /// The provider payment id is already attached to a different
    /// redemption for this merchant; a single payment confirms at most one.
    PaymentLinkedElsewhere,
    /// The redemption was not in a confirmable state.
    Conflict(RedemptionStatus),
}

/// Interface for redemption persistence.
///
/// Every transition is a status check-and-set so that it is exactly-once
/// under concurrent attempts; `confirm_and_debit` additionally wraps the
/// ledger write and the transition in a single transaction.
#[async_trait]
pub trait RedemptionStore: Send + Sync {
    /// Insert a new PENDING redemption.
    ///
    /// A unique-constraint conflict on the token or PIN reports
    /// `CodeCollision` instead of failing.
    async fn insert(&self, redemption: NewRedemption) -> Result<InsertOutcome>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Redemption>>;

    /// Look up by token or PIN, whichever matches.
    async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>>;

    /// Cancel all PENDING redemptions for the pair. Returns count affected.
    async fn cancel_pending_for_pair(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        canceled_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Check-and-set PENDING -> IN_PROGRESS, stamping `locked_at`.
    ///
    /// Returns the updated record, or None if the redemption was no longer
    /// PENDING (lost the race or already used).
    async fn lock(&self, id: Uuid, locked_at: DateTime<Utc>) -> Result<Option<Redemption>>;

    /// Check-and-set IN_PROGRESS -> CONFIRMED and write the debit entry in
    /// one transaction, with a balance check immediately preceding the
    /// debit inside that same transaction.
    ///
    /// `debit` is the REDEEM ledger entry to write; a zero-point debit
    /// (item-threshold rewards) skips the ledger write but still transitions.
    async fn confirm_and_debit(
        &self,
        id: Uuid,
        provider_payment_id: Option<&str>,
        provider_order_id: Option<&str>,
        debit: Option<NewLedgerEntry>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<ConfirmOutcome>;

    /// Check-and-set PENDING -> CANCELED.
    ///
    /// Returns the updated record, or None if the redemption was no longer
    /// PENDING.
    async fn cancel(&self, id: Uuid, canceled_at: DateTime<Utc>) -> Result<Option<Redemption>>;

    /// Bulk check-and-set of PENDING/IN_PROGRESS past their deadline to
    /// CANCELED. Returns count affected.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// The redemption carrying this provider payment id for the merchant,
    /// if any. The (merchant, payment) pair is unique.
    async fn find_by_provider_payment(
        &self,
        merchant_id: Uuid,
        provider_payment_id: &str,
    ) -> Result<Option<Redemption>>;

    /// IN_PROGRESS, unexpired, payment-unlinked redemptions for the pair,
    /// ordered oldest-first by creation time with id as the tie-breaker so
    /// selection is a total order.
    async fn auto_confirm_candidates(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Redemption>>;
}
