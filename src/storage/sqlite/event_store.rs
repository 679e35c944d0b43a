//! SQLite WebhookEventStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Asterisk, Expr, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::{EventStatus, WebhookEvent};
use crate::interfaces::{IngestOutcome, NewWebhookEvent, Result, StorageError, WebhookEventStore};
use crate::storage::schema::WebhookEvents;
use crate::storage::{fmt_ts, parse_ts, parse_ts_opt};

use super::is_unique_violation;

/// SQLite implementation of WebhookEventStore.
pub struct SqliteWebhookEventStore {
    pool: SqlitePool,
}

impl SqliteWebhookEventStore {
    /// Create a new SQLite webhook event store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_by_external(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<WebhookEvent>> {
        let query = Query::select()
            .column(Asterisk)
            .from(WebhookEvents::Table)
            .and_where(Expr::col(WebhookEvents::Provider).eq(provider))
            .and_where(Expr::col(WebhookEvents::ExternalId).eq(external_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    async fn set_terminal(
        &self,
        id: Uuid,
        status: EventStatus,
        message: Option<&str>,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = Query::update()
            .table(WebhookEvents::Table)
            .value(WebhookEvents::Status, status.as_str())
            .value(WebhookEvents::ErrorMessage, message.map(str::to_string))
            .value(WebhookEvents::ProcessedAt, fmt_ts(processed_at))
            .and_where(Expr::col(WebhookEvents::Id).eq(id.to_string()))
            .and_where(Expr::col(WebhookEvents::Status).eq(EventStatus::Received.as_str()))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl WebhookEventStore for SqliteWebhookEventStore {
    async fn ingest(&self, event: NewWebhookEvent) -> Result<IngestOutcome> {
        let query = Query::insert()
            .into_table(WebhookEvents::Table)
            .columns([
                WebhookEvents::Id,
                WebhookEvents::Provider,
                WebhookEvents::ExternalId,
                WebhookEvents::EventType,
                WebhookEvents::Payload,
                WebhookEvents::Status,
                WebhookEvents::ReceivedAt,
            ])
            .values_panic([
                event.id.to_string().into(),
                event.provider.clone().into(),
                event.external_id.clone().into(),
                event.event_type.clone().into(),
                event.payload.clone().into(),
                EventStatus::Received.as_str().into(),
                fmt_ts(event.received_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(IngestOutcome::Fresh(WebhookEvent {
                id: event.id,
                provider: event.provider,
                external_id: event.external_id,
                event_type: event.event_type,
                payload: event.payload,
                status: EventStatus::Received,
                error_message: None,
                processed_at: None,
                received_at: event.received_at,
            })),
            Err(e) if is_unique_violation(&e) => {
                match self
                    .find_by_external(&event.provider, &event.external_id)
                    .await?
                {
                    Some(existing) => Ok(IngestOutcome::Duplicate(existing)),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>> {
        let query = Query::select()
            .column(Asterisk)
            .from(WebhookEvents::Table)
            .and_where(Expr::col(WebhookEvents::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_event(&r)).transpose()
    }

    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<bool> {
        self.set_terminal(id, EventStatus::Processed, None, processed_at)
            .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.set_terminal(id, EventStatus::Failed, Some(message), processed_at)
            .await
    }
}

fn row_to_event(row: &SqliteRow) -> Result<WebhookEvent> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let received_at: String = row.get("received_at");

    Ok(WebhookEvent {
        id: Uuid::parse_str(&id)?,
        provider: row.get("provider"),
        external_id: row.get("external_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        status: EventStatus::parse(&status)
            .ok_or_else(|| StorageError::corrupt("webhook_events", format!("status: {status}")))?,
        error_message: row.get("error_message"),
        processed_at: parse_ts_opt(row.get("processed_at"))?,
        received_at: parse_ts(&received_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_pool;

    fn inbound(provider: &str, external_id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            event_type: "payment.updated".to_string(),
            payload: r#"{"payment_id":"p1"}"#.to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ingest_deduplicates_per_provider() {
        let store = SqliteWebhookEventStore::new(test_pool().await);

        let first = store.ingest(inbound("square", "evt-1")).await.unwrap();
        let IngestOutcome::Fresh(first) = first else {
            panic!("expected fresh event");
        };

        let redelivery = store.ingest(inbound("square", "evt-1")).await.unwrap();
        let IngestOutcome::Duplicate(dup) = redelivery else {
            panic!("expected duplicate");
        };
        assert_eq!(dup.id, first.id);

        // The same external id from another provider is a distinct event.
        let other = store.ingest(inbound("clover", "evt-1")).await.unwrap();
        assert!(matches!(other, IngestOutcome::Fresh(_)));
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let store = SqliteWebhookEventStore::new(test_pool().await);

        let IngestOutcome::Fresh(event) = store.ingest(inbound("square", "evt-2")).await.unwrap()
        else {
            panic!("expected fresh event");
        };

        assert!(store.mark_processed(event.id, Utc::now()).await.unwrap());
        // Already terminal: both transitions refuse.
        assert!(!store.mark_processed(event.id, Utc::now()).await.unwrap());
        assert!(!store.mark_failed(event.id, "late", Utc::now()).await.unwrap());

        let stored = store.find_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processed);
        assert!(stored.error_message.is_none());
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_records_message() {
        let store = SqliteWebhookEventStore::new(test_pool().await);

        let IngestOutcome::Fresh(event) = store.ingest(inbound("square", "evt-3")).await.unwrap()
        else {
            panic!("expected fresh event");
        };

        assert!(store
            .mark_failed(event.id, "business/merchant not found", Utc::now())
            .await
            .unwrap());
        let stored = store.find_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("business/merchant not found")
        );
    }
}
