//! Webhook event processor.
//!
//! Consumes recorded events exactly-once from a business standpoint:
//! `process_event` drives an event to PROCESSED or FAILED and converts
//! every business failure into the terminal status plus message instead of
//! propagating it, so one malformed event cannot block the pipeline or
//! retry-storm the provider. Events are never retried here; reprocessing is
//! a backfill collaborator's concern.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{RedemptionStatus, WebhookEvent};
use crate::interfaces::{
    Directory, RedemptionStore, Result, RewardCatalog, StorageError, WebhookEventStore,
};
use crate::ledger::{LedgerError, PointsLedger};
use crate::points::compute_earned;
use crate::redemption::RedemptionEngine;
use crate::utils::Clock;

use super::{earn_ref, is_payment_event, PaymentPayload, PAYMENT_STATUS_COMPLETED};

/// What processing an event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Points were credited (or the credit replayed idempotently); the
    /// event is PROCESSED.
    Processed {
        credited_points: i64,
        auto_confirmed: Option<Uuid>,
    },
    /// Nothing to do for this event; it is PROCESSED.
    Skipped { reason: String },
    /// Processing failed; the event is FAILED with the reason recorded.
    Failed { reason: String },
    /// The event was already terminal; nothing was done.
    AlreadyTerminal,
}

/// Internal processing failure, converted to a FAILED status at the
/// `process_event` boundary.
#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error("business/merchant not found")]
    MerchantNotFound,

    #[error("earn rule not configured")]
    EarnRuleMissing,

    #[error("invalid payment payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Handled {
    Credited {
        points: i64,
        auto_confirmed: Option<Uuid>,
    },
    Skip(String),
}

/// Processes recorded webhook events: credits earned points and attempts
/// auto-confirmation of a pending redemption.
pub struct WebhookProcessor {
    events: Arc<dyn WebhookEventStore>,
    directory: Arc<dyn Directory>,
    catalog: Arc<dyn RewardCatalog>,
    redemptions: Arc<dyn RedemptionStore>,
    ledger: Arc<PointsLedger>,
    engine: Arc<RedemptionEngine>,
    clock: Arc<dyn Clock>,
}

impl WebhookProcessor {
    pub fn new(
        events: Arc<dyn WebhookEventStore>,
        directory: Arc<dyn Directory>,
        catalog: Arc<dyn RewardCatalog>,
        redemptions: Arc<dyn RedemptionStore>,
        ledger: Arc<PointsLedger>,
        engine: Arc<RedemptionEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            directory,
            catalog,
            redemptions,
            ledger,
            engine,
            clock,
        }
    }

    /// Process a recorded event to a terminal status.
    ///
    /// Business failures never propagate; they become a FAILED status plus
    /// message. The only errors surfaced to the caller are failures of the
    /// store itself (including the terminal status write - a recorded
    /// outcome is never reported unless it was durably written).
    pub async fn process_event(&self, event_id: Uuid) -> Result<EventOutcome> {
        let event = self.events.find_by_id(event_id).await?.ok_or_else(|| {
            StorageError::corrupt("webhook_events", format!("unknown event: {event_id}"))
        })?;

        if event.status != crate::domain::EventStatus::Received {
            debug!(event_id = %event.id, status = event.status.as_str(), "Event already terminal");
            return Ok(EventOutcome::AlreadyTerminal);
        }

        match self.handle(&event).await {
            Ok(Handled::Credited {
                points,
                auto_confirmed,
            }) => {
                self.events.mark_processed(event.id, self.clock.now()).await?;
                info!(
                    event_id = %event.id,
                    points,
                    auto_confirmed = ?auto_confirmed,
                    "Event processed"
                );
                Ok(EventOutcome::Processed {
                    credited_points: points,
                    auto_confirmed,
                })
            }
            Ok(Handled::Skip(reason)) => {
                self.events.mark_processed(event.id, self.clock.now()).await?;
                debug!(event_id = %event.id, reason = %reason, "Event skipped");
                Ok(EventOutcome::Skipped { reason })
            }
            Err(e) => {
                let reason = e.to_string();
                self.events
                    .mark_failed(event.id, &reason, self.clock.now())
                    .await?;
                warn!(event_id = %event.id, reason = %reason, "Event failed");
                Ok(EventOutcome::Failed { reason })
            }
        }
    }

    async fn handle(&self, event: &WebhookEvent) -> std::result::Result<Handled, ProcessError> {
        if !is_payment_event(&event.event_type) {
            return Ok(Handled::Skip(format!(
                "not a payment event: {}",
                event.event_type
            )));
        }

        let payload = PaymentPayload::parse(&event.payload)?;
        if payload.status != PAYMENT_STATUS_COMPLETED {
            return Ok(Handled::Skip(format!(
                "payment not completed: {}",
                payload.status
            )));
        }

        let merchant_id = self
            .directory
            .merchant_for_location(&event.provider, &payload.location_id)
            .await?
            .ok_or(ProcessError::MerchantNotFound)?;

        let Some(ref provider_customer_id) = payload.customer_id else {
            return Ok(Handled::Skip("payment has no customer".to_string()));
        };
        let Some(customer_id) = self
            .directory
            .customer_for_provider(&event.provider, provider_customer_id, merchant_id)
            .await?
        else {
            return Ok(Handled::Skip(format!(
                "no customer link for {provider_customer_id}"
            )));
        };

        let rule = self
            .catalog
            .earn_rule(merchant_id)
            .await?
            .ok_or(ProcessError::EarnRuleMissing)?;

        let earned = compute_earned(payload.amount_minor, &rule);
        if !earned.eligible {
            return Ok(Handled::Skip(format!(
                "amount {} below minimum",
                payload.amount_minor
            )));
        }
        if earned.points == 0 {
            return Ok(Handled::Skip("computed zero points".to_string()));
        }

        // Redelivery of the same payment replays onto the existing entry.
        self.ledger
            .record_earn(
                customer_id,
                merchant_id,
                earned.points,
                Some(earn_ref(&event.provider, &payload.payment_id)),
                Some(format!("payment {}", payload.payment_id)),
            )
            .await?;

        // Auto-confirm runs whether the credit was fresh or a replay; it
        // carries its own idempotency guard and is best-effort: nothing it
        // does may fail the event or roll the credit back.
        let auto_confirmed = match self
            .auto_confirm(
                customer_id,
                merchant_id,
                &payload.payment_id,
                payload.order_id.as_deref(),
            )
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!(
                    payment_id = %payload.payment_id,
                    error = %e,
                    "Auto-confirm failed, points retained"
                );
                None
            }
        };

        Ok(Handled::Credited {
            points: earned.points,
            auto_confirmed,
        })
    }

    /// Opportunistically confirm the oldest matching locked redemption.
    async fn auto_confirm(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        payment_id: &str,
        order_id: Option<&str>,
    ) -> Result<Option<Uuid>> {
        // Redelivery guard: this payment may already have confirmed one.
        if let Some(existing) = self
            .redemptions
            .find_by_provider_payment(merchant_id, payment_id)
            .await?
        {
            if existing.status == RedemptionStatus::Confirmed {
                debug!(
                    redemption_id = %existing.id,
                    payment_id = %payment_id,
                    "Payment already confirmed a redemption"
                );
                return Ok(Some(existing.id));
            }
        }

        let candidates = self
            .redemptions
            .auto_confirm_candidates(customer_id, merchant_id, self.clock.now())
            .await?;
        let Some(oldest) = candidates.first() else {
            return Ok(None);
        };

        match self
            .engine
            .confirm(oldest.id, Some(payment_id), order_id)
            .await
        {
            Ok(confirmed) => {
                info!(
                    redemption_id = %confirmed.id,
                    payment_id = %payment_id,
                    "Redemption auto-confirmed"
                );
                Ok(Some(confirmed.id))
            }
            Err(e) => {
                warn!(
                    redemption_id = %oldest.id,
                    payment_id = %payment_id,
                    error = %e,
                    "Auto-confirm attempt failed"
                );
                Ok(None)
            }
        }
    }
}
