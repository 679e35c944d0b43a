//! Core domain records for the points ledger and redemption lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Earn,
    Redeem,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Earn => "earn",
            EntryKind::Redeem => "redeem",
            EntryKind::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earn" => Some(EntryKind::Earn),
            "redeem" => Some(EntryKind::Redeem),
            "refund" => Some(EntryKind::Refund),
            _ => None,
        }
    }
}

/// An immutable signed point delta for a (customer, merchant) pair.
///
/// The balance for a pair is the sum of `points` across all of its entries.
/// Entries are never updated or deleted. When `external_ref` is present, at
/// most one entry exists per (merchant, kind, external_ref) - that triple is
/// the idempotency key for webhook-sourced writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub kind: EntryKind,
    /// Signed delta: positive for earn, negative for redeem/refund.
    pub points: i64,
    pub external_ref: Option<String>,
    /// Redemption that produced this entry, for redeem/refund rows.
    pub redemption_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedemptionStatus {
    Pending,
    InProgress,
    Confirmed,
    Canceled,
    Expired,
}

impl RedemptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::InProgress => "in_progress",
            RedemptionStatus::Confirmed => "confirmed",
            RedemptionStatus::Canceled => "canceled",
            RedemptionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RedemptionStatus::Pending),
            "in_progress" => Some(RedemptionStatus::InProgress),
            "confirmed" => Some(RedemptionStatus::Confirmed),
            "canceled" => Some(RedemptionStatus::Canceled),
            "expired" => Some(RedemptionStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RedemptionStatus::Confirmed | RedemptionStatus::Canceled | RedemptionStatus::Expired
        )
    }
}

/// A customer's in-progress or completed spend of points on a reward.
///
/// The token and PIN are each single-use and globally unique. A provider
/// payment id, once set, is unique per merchant: a single provider payment
/// confirms at most one redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    pub reward_id: Uuid,
    pub status: RedemptionStatus,
    /// Merchant-scannable code, 32 hex characters.
    pub token: String,
    /// Short numeric code the customer can read out, 6 digits.
    pub pin: String,
    pub expires_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub provider_payment_id: Option<String>,
    pub provider_order_id: Option<String>,
    /// Points actually debited at confirmation time, decoupled from the
    /// reward's current configured cost.
    pub points_deducted: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Redemption {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Processing status of an inbound provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(EventStatus::Received),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

/// A durably recorded, deduplicated inbound notification from a provider.
///
/// Exactly one record exists per (provider, external_id). Status only moves
/// Received -> {Processed, Failed}, never back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    /// Provider-assigned event id, the dedup key within a provider.
    pub external_id: String,
    pub event_type: String,
    /// Raw JSON payload as delivered.
    pub payload: String,
    pub status: EventStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// How a reward is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardKind {
    /// Costs a fixed number of points, debited at confirmation.
    PointsCost { cost: i64 },
    /// Earned by item count; the threshold bookkeeping is owned by the
    /// catalog collaborator, so confirmation debits nothing here.
    ItemThreshold { threshold: u32 },
}

/// A reward definition, read-only from this crate's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub name: String,
    pub kind: RewardKind,
    pub enabled: bool,
}

impl Reward {
    /// Points required to redeem, zero for item-threshold rewards.
    pub fn points_cost(&self) -> i64 {
        match self.kind {
            RewardKind::PointsCost { cost } => cost,
            RewardKind::ItemThreshold { .. } => 0,
        }
    }
}
