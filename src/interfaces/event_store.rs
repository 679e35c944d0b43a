//! Webhook event storage interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::WebhookEvent;

use super::Result;

/// Fields for an inbound event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub event_type: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

/// Outcome of a dedup insert.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// First delivery of this (provider, external_id).
    Fresh(WebhookEvent),
    /// Redelivery; the previously recorded event is returned unchanged.
    Duplicate(WebhookEvent),
}

impl IngestOutcome {
    pub fn event(&self) -> &WebhookEvent {
        match self {
            IngestOutcome::Fresh(e) | IngestOutcome::Duplicate(e) => e,
        }
    }
}

/// Interface for the durable record of inbound provider events.
///
/// Exactly one record exists per (provider, external_id); the insert races
/// are settled by the unique constraint, with the loser reading back the
/// winner. Status only moves Received -> {Processed, Failed}.
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Record an inbound event, deduplicating on (provider, external_id).
    async fn ingest(&self, event: NewWebhookEvent) -> Result<IngestOutcome>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>>;

    /// Check-and-set Received -> Processed. Returns false if the event was
    /// already terminal.
    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<bool>;

    /// Check-and-set Received -> Failed with a message. Returns false if
    /// the event was already terminal.
    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool>;
}
