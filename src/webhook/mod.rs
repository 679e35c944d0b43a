//! Inbound provider event processing.
//!
//! The transport layer performs the dedup insert via
//! [`WebhookEventStore::ingest`](crate::interfaces::WebhookEventStore::ingest)
//! and then invokes [`WebhookProcessor::process_event`], synchronously or
//! from a queue. Delivery is at-least-once; every dedup point tolerates
//! redelivery.

mod processor;

pub use processor::{EventOutcome, WebhookProcessor};

use serde::{Deserialize, Serialize};

/// Event types that denote a payment notification.
pub const PAYMENT_EVENT_TYPES: &[&str] = &["payment.created", "payment.updated"];

/// Embedded payment status denoting completion.
pub const PAYMENT_STATUS_COMPLETED: &str = "COMPLETED";

/// Whether an event type denotes a payment notification.
pub fn is_payment_event(event_type: &str) -> bool {
    PAYMENT_EVENT_TYPES.contains(&event_type)
}

/// The payment fields this core reads out of a provider event payload.
///
/// Unknown payload fields are ignored rather than rejected; providers add
/// fields without notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentPayload {
    /// Provider-assigned payment id.
    pub payment_id: String,
    /// Payment status as reported, e.g. "COMPLETED".
    pub status: String,
    /// Amount in minor currency units.
    pub amount_minor: i64,
    /// Provider-side location the payment was taken at.
    pub location_id: String,
    /// Provider-side customer id, when the payment is linked to one.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Provider-side order id, when available.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl PaymentPayload {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// External ref crediting a payment: `"<provider>:payment:<payment_id>"`.
///
/// Derived deterministically from the provider payment id so that
/// redelivery of the same payment never double-credits.
pub fn earn_ref(provider: &str, payment_id: &str) -> String {
    format!("{provider}:payment:{payment_id}")
}
