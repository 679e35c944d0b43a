//! Redemption lifecycle state machine.
//!
//! Owns token issuance, merchant-side locking, confirmation (the only
//! transition that debits the ledger), cancellation and the expiry sweep.
//! Transitions are exactly-once: each one is a status check-and-set in the
//! store, and confirmation commits its ledger debit in the same
//! transaction as the status change.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RedemptionConfig;
use crate::domain::{EntryKind, Redemption, RedemptionStatus};
use crate::interfaces::{
    ConfirmOutcome, InsertOutcome, LedgerStore, NewLedgerEntry, NewRedemption, RedemptionStore,
    RewardCatalog, StorageError,
};
use crate::utils::Clock;

/// Result type for redemption operations.
pub type Result<T> = std::result::Result<T, RedemptionError>;

/// Errors surfaced by redemption operations.
#[derive(Debug, thiserror::Error)]
pub enum RedemptionError {
    #[error("Redemption not found")]
    NotFound,

    #[error("Reward not found")]
    RewardNotFound,

    #[error("Reward is disabled")]
    RewardDisabled,

    #[error("Reward belongs to a different merchant")]
    WrongMerchant,

    #[error("Redemption belongs to a different customer")]
    NotOwner,

    #[error("Invalid state for this transition: {0:?}")]
    InvalidState(RedemptionStatus),

    #[error("Redemption has expired")]
    Expired,

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("Provider payment already confirms another redemption")]
    PaymentAlreadyLinked,

    #[error("Could not generate a unique token/PIN after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// External ref for the REDEEM entry written at confirmation.
///
/// Deduplicated per (merchant, kind, external_ref), so a redemption debits
/// at most once no matter how many confirm attempts race.
fn debit_ref(redemption_id: Uuid) -> String {
    format!("redemption:{redemption_id}")
}

fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

fn generate_pin() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// The redemption state machine.
pub struct RedemptionEngine {
    store: Arc<dyn RedemptionStore>,
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<dyn RewardCatalog>,
    clock: Arc<dyn Clock>,
    config: RedemptionConfig,
}

impl RedemptionEngine {
    pub fn new(
        store: Arc<dyn RedemptionStore>,
        ledger: Arc<dyn LedgerStore>,
        catalog: Arc<dyn RewardCatalog>,
        clock: Arc<dyn Clock>,
        config: RedemptionConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            catalog,
            clock,
            config,
        }
    }

    /// Create a PENDING redemption for a reward.
    ///
    /// Any prior PENDING redemption for the same (customer, merchant) is
    /// superseded, so at most one exists per pair. The balance check here
    /// is advisory; confirmation re-checks inside its transaction since the
    /// balance can change in between.
    pub async fn create(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        reward_id: Uuid,
    ) -> Result<Redemption> {
        let reward = self
            .catalog
            .reward(reward_id)
            .await?
            .ok_or(RedemptionError::RewardNotFound)?;
        if reward.merchant_id != merchant_id {
            return Err(RedemptionError::WrongMerchant);
        }
        if !reward.enabled {
            return Err(RedemptionError::RewardDisabled);
        }

        let cost = reward.points_cost();
        if cost > 0 {
            let available = self.ledger.sum_points(customer_id, merchant_id).await?;
            if available < cost {
                return Err(RedemptionError::InsufficientBalance {
                    required: cost,
                    available,
                });
            }
        }

        let now = self.clock.now();
        let superseded = self
            .store
            .cancel_pending_for_pair(customer_id, merchant_id, now)
            .await?;
        if superseded > 0 {
            debug!(
                customer_id = %customer_id,
                merchant_id = %merchant_id,
                count = superseded,
                "Superseded pending redemptions"
            );
        }

        for attempt in 1..=self.config.max_code_attempts {
            let redemption = NewRedemption {
                id: Uuid::new_v4(),
                customer_id,
                merchant_id,
                reward_id,
                token: generate_token(),
                pin: generate_pin(),
                expires_at: now + self.config.ttl(),
                created_at: now,
            };

            match self.store.insert(redemption).await? {
                InsertOutcome::Inserted(redemption) => {
                    info!(
                        redemption_id = %redemption.id,
                        merchant_id = %merchant_id,
                        reward_id = %reward_id,
                        "Redemption created"
                    );
                    return Ok(redemption);
                }
                InsertOutcome::CodeCollision => {
                    warn!(attempt, "Token/PIN collision, regenerating");
                }
            }
        }

        Err(RedemptionError::GenerationExhausted {
            attempts: self.config.max_code_attempts,
        })
    }

    /// Look up a redemption by token or PIN and lock it for confirmation.
    ///
    /// The lock is a status check-and-set, so it succeeds exactly once per
    /// redemption: a concurrent second attempt loses the update and fails
    /// with a state conflict.
    pub async fn verify_and_lock(&self, merchant_id: Uuid, code: &str) -> Result<Redemption> {
        let redemption = self
            .store
            .find_by_code(code)
            .await?
            .ok_or(RedemptionError::NotFound)?;

        if redemption.merchant_id != merchant_id {
            return Err(RedemptionError::WrongMerchant);
        }
        if redemption.status != RedemptionStatus::Pending {
            return Err(RedemptionError::InvalidState(redemption.status));
        }
        let now = self.clock.now();
        if redemption.is_expired(now) {
            return Err(RedemptionError::Expired);
        }

        match self.store.lock(redemption.id, now).await? {
            Some(locked) => {
                info!(redemption_id = %locked.id, merchant_id = %merchant_id, "Redemption locked");
                Ok(locked)
            }
            None => {
                // Lost the check-and-set; report the state that won.
                let current = self
                    .store
                    .find_by_id(redemption.id)
                    .await?
                    .ok_or(RedemptionError::NotFound)?;
                Err(RedemptionError::InvalidState(current.status))
            }
        }
    }

    /// Confirm a locked redemption, debiting the ledger.
    ///
    /// Idempotent: confirming an already-CONFIRMED redemption returns the
    /// existing record without a second debit. The debit and the transition
    /// commit as one transaction, with the balance re-checked immediately
    /// before the debit inside it.
    pub async fn confirm(
        &self,
        redemption_id: Uuid,
        provider_payment_id: Option<&str>,
        provider_order_id: Option<&str>,
    ) -> Result<Redemption> {
        let redemption = self
            .store
            .find_by_id(redemption_id)
            .await?
            .ok_or(RedemptionError::NotFound)?;

        match redemption.status {
            RedemptionStatus::Confirmed => return Ok(redemption),
            RedemptionStatus::InProgress => {}
            other => return Err(RedemptionError::InvalidState(other)),
        }
        let now = self.clock.now();
        if redemption.is_expired(now) {
            return Err(RedemptionError::Expired);
        }

        let reward = self
            .catalog
            .reward(redemption.reward_id)
            .await?
            .ok_or(RedemptionError::RewardNotFound)?;
        let cost = reward.points_cost();
        let debit = (cost > 0).then(|| NewLedgerEntry {
            id: Uuid::new_v4(),
            customer_id: redemption.customer_id,
            merchant_id: redemption.merchant_id,
            kind: EntryKind::Redeem,
            points: -cost,
            external_ref: Some(debit_ref(redemption.id)),
            redemption_id: Some(redemption.id),
            note: Some(reward.name.clone()),
            created_at: now,
        });

        match self
            .store
            .confirm_and_debit(
                redemption.id,
                provider_payment_id,
                provider_order_id,
                debit,
                now,
            )
            .await?
        {
            ConfirmOutcome::Confirmed(confirmed) => {
                info!(
                    redemption_id = %confirmed.id,
                    points_deducted = confirmed.points_deducted.unwrap_or(0),
                    "Redemption confirmed"
                );
                Ok(confirmed)
            }
            ConfirmOutcome::AlreadyConfirmed(existing) => Ok(existing),
            ConfirmOutcome::InsufficientBalance {
                required,
                available,
            } => Err(RedemptionError::InsufficientBalance {
                required,
                available,
            }),
            ConfirmOutcome::PaymentLinkedElsewhere => Err(RedemptionError::PaymentAlreadyLinked),
            ConfirmOutcome::Conflict(status) => Err(RedemptionError::InvalidState(status)),
        }
    }

    /// Cancel a PENDING redemption. Only the owning customer may cancel;
    /// no ledger effect since nothing was deducted while PENDING.
    pub async fn cancel(&self, redemption_id: Uuid, requester_customer_id: Uuid) -> Result<Redemption> {
        let redemption = self
            .store
            .find_by_id(redemption_id)
            .await?
            .ok_or(RedemptionError::NotFound)?;

        if redemption.customer_id != requester_customer_id {
            return Err(RedemptionError::NotOwner);
        }
        if redemption.status != RedemptionStatus::Pending {
            return Err(RedemptionError::InvalidState(redemption.status));
        }

        match self.store.cancel(redemption.id, self.clock.now()).await? {
            Some(canceled) => {
                info!(redemption_id = %canceled.id, "Redemption canceled");
                Ok(canceled)
            }
            None => {
                let current = self
                    .store
                    .find_by_id(redemption.id)
                    .await?
                    .ok_or(RedemptionError::NotFound)?;
                Err(RedemptionError::InvalidState(current.status))
            }
        }
    }

    /// Cancel all PENDING/IN_PROGRESS redemptions past their deadline.
    /// Returns the count affected. No ledger effect.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let count = self.store.sweep_expired(self.clock.now()).await?;
        if count > 0 {
            info!(count, "Swept expired redemptions");
        }
        Ok(count)
    }
}
