//! SQLite RedemptionStore implementation.
//!
//! Transitions are status check-and-set updates; confirm additionally wraps
//! the ledger debit and the transition in one BEGIN IMMEDIATE transaction
//! so partial application (debited but not confirmed, or vice versa) is
//! unreachable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Asterisk, Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::{Redemption, RedemptionStatus};
use crate::interfaces::{
    ConfirmOutcome, InsertOutcome, NewLedgerEntry, NewRedemption, RedemptionStore, Result,
    StorageError,
};
use crate::storage::schema::{LedgerEntries, Redemptions};
use crate::storage::{fmt_ts, parse_ts, parse_ts_opt};

use super::is_unique_violation;

/// SQLite implementation of RedemptionStore.
pub struct SqliteRedemptionStore {
    pool: SqlitePool,
}

impl SqliteRedemptionStore {
    /// Create a new SQLite redemption store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn select_by_id_sql(id: Uuid) -> String {
        Query::select()
            .column(Asterisk)
            .from(Redemptions::Table)
            .and_where(Expr::col(Redemptions::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder)
    }

    async fn fetch_by_id(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Redemption>> {
        let query = Self::select_by_id_sql(id);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.map(|r| row_to_redemption(&r)).transpose()
    }

    async fn confirm_in_txn(
        conn: &mut SqliteConnection,
        id: Uuid,
        provider_payment_id: Option<&str>,
        provider_order_id: Option<&str>,
        debit: Option<&NewLedgerEntry>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let current = Self::fetch_by_id(conn, id).await?.ok_or_else(|| {
            // Rows are never deleted; an absent row here is an invariant
            // violation, not a race.
            StorageError::corrupt("redemptions", format!("confirm target vanished: {id}"))
        })?;

        match current.status {
            RedemptionStatus::Confirmed => return Ok(ConfirmOutcome::AlreadyConfirmed(current)),
            RedemptionStatus::InProgress => {}
            other => return Ok(ConfirmOutcome::Conflict(other)),
        }

        let mut points_deducted = 0i64;
        if let Some(debit) = debit {
            let query = Query::select()
                .expr(Expr::col(LedgerEntries::Points).sum())
                .from(LedgerEntries::Table)
                .and_where(Expr::col(LedgerEntries::CustomerId).eq(debit.customer_id.to_string()))
                .and_where(Expr::col(LedgerEntries::MerchantId).eq(debit.merchant_id.to_string()))
                .to_string(SqliteQueryBuilder);
            let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
            let available: i64 = row.get::<Option<i64>, _>(0).unwrap_or(0);

            if available + debit.points < 0 {
                return Ok(ConfirmOutcome::InsufficientBalance {
                    required: -debit.points,
                    available,
                });
            }

            let query = Query::insert()
                .into_table(LedgerEntries::Table)
                .columns([
                    LedgerEntries::Id,
                    LedgerEntries::CustomerId,
                    LedgerEntries::MerchantId,
                    LedgerEntries::Kind,
                    LedgerEntries::Points,
                    LedgerEntries::ExternalRef,
                    LedgerEntries::RedemptionId,
                    LedgerEntries::Note,
                    LedgerEntries::CreatedAt,
                ])
                .values_panic([
                    debit.id.to_string().into(),
                    debit.customer_id.to_string().into(),
                    debit.merchant_id.to_string().into(),
                    debit.kind.as_str().into(),
                    debit.points.into(),
                    debit.external_ref.clone().into(),
                    debit.redemption_id.map(|r| r.to_string()).into(),
                    debit.note.clone().into(),
                    fmt_ts(debit.created_at).into(),
                ])
                .to_string(SqliteQueryBuilder);

            if let Err(e) = sqlx::query(&query).execute(&mut *conn).await {
                if is_unique_violation(&e) {
                    // A concurrent confirm already debited; it also owns the
                    // transition, so report whatever it settled on.
                    let settled = Self::fetch_by_id(conn, id).await?;
                    return match settled {
                        Some(r) if r.status == RedemptionStatus::Confirmed => {
                            Ok(ConfirmOutcome::AlreadyConfirmed(r))
                        }
                        Some(r) => Ok(ConfirmOutcome::Conflict(r.status)),
                        None => Err(e.into()),
                    };
                }
                return Err(e.into());
            }
            points_deducted = -debit.points;
        }

        let query = Query::update()
            .table(Redemptions::Table)
            .value(Redemptions::Status, RedemptionStatus::Confirmed.as_str())
            .value(Redemptions::ConfirmedAt, fmt_ts(confirmed_at))
            .value(
                Redemptions::ProviderPaymentId,
                provider_payment_id.map(str::to_string),
            )
            .value(
                Redemptions::ProviderOrderId,
                provider_order_id.map(str::to_string),
            )
            .value(Redemptions::PointsDeducted, points_deducted)
            .and_where(Expr::col(Redemptions::Id).eq(id.to_string()))
            .and_where(Expr::col(Redemptions::Status).eq(RedemptionStatus::InProgress.as_str()))
            .to_string(SqliteQueryBuilder);

        let affected = match sqlx::query(&query).execute(&mut *conn).await {
            Ok(done) => done.rows_affected(),
            Err(e) if is_unique_violation(&e) => {
                // (merchant, provider_payment_id) already taken by another
                // redemption.
                return Ok(ConfirmOutcome::PaymentLinkedElsewhere);
            }
            Err(e) => return Err(e.into()),
        };

        if affected == 0 {
            let settled = Self::fetch_by_id(conn, id).await?.ok_or_else(|| {
                StorageError::corrupt("redemptions", format!("confirm target vanished: {id}"))
            })?;
            return match settled.status {
                RedemptionStatus::Confirmed => Ok(ConfirmOutcome::AlreadyConfirmed(settled)),
                other => Ok(ConfirmOutcome::Conflict(other)),
            };
        }

        let confirmed = Self::fetch_by_id(conn, id).await?.ok_or_else(|| {
            StorageError::corrupt("redemptions", format!("confirm target vanished: {id}"))
        })?;
        Ok(ConfirmOutcome::Confirmed(confirmed))
    }
}

#[async_trait]
impl RedemptionStore for SqliteRedemptionStore {
    async fn insert(&self, redemption: NewRedemption) -> Result<InsertOutcome> {
        let query = Query::insert()
            .into_table(Redemptions::Table)
            .columns([
                Redemptions::Id,
                Redemptions::CustomerId,
                Redemptions::MerchantId,
                Redemptions::RewardId,
                Redemptions::Status,
                Redemptions::Token,
                Redemptions::Pin,
                Redemptions::ExpiresAt,
                Redemptions::CreatedAt,
            ])
            .values_panic([
                redemption.id.to_string().into(),
                redemption.customer_id.to_string().into(),
                redemption.merchant_id.to_string().into(),
                redemption.reward_id.to_string().into(),
                RedemptionStatus::Pending.as_str().into(),
                redemption.token.clone().into(),
                redemption.pin.clone().into(),
                fmt_ts(redemption.expires_at).into(),
                fmt_ts(redemption.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(InsertOutcome::Inserted(Redemption {
                id: redemption.id,
                customer_id: redemption.customer_id,
                merchant_id: redemption.merchant_id,
                reward_id: redemption.reward_id,
                status: RedemptionStatus::Pending,
                token: redemption.token,
                pin: redemption.pin,
                expires_at: redemption.expires_at,
                locked_at: None,
                confirmed_at: None,
                canceled_at: None,
                provider_payment_id: None,
                provider_order_id: None,
                points_deducted: None,
                created_at: redemption.created_at,
            })),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::CodeCollision),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Redemption>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_by_id(&mut conn, id).await
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Redemption>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Redemptions::Table)
            .cond_where(
                sea_query::Cond::any()
                    .add(Expr::col(Redemptions::Token).eq(code))
                    .add(Expr::col(Redemptions::Pin).eq(code)),
            )
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_redemption(&r)).transpose()
    }

    async fn cancel_pending_for_pair(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        canceled_at: DateTime<Utc>,
    ) -> Result<u64> {
        let query = Query::update()
            .table(Redemptions::Table)
            .value(Redemptions::Status, RedemptionStatus::Canceled.as_str())
            .value(Redemptions::CanceledAt, fmt_ts(canceled_at))
            .and_where(Expr::col(Redemptions::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(Redemptions::MerchantId).eq(merchant_id.to_string()))
            .and_where(Expr::col(Redemptions::Status).eq(RedemptionStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn lock(&self, id: Uuid, locked_at: DateTime<Utc>) -> Result<Option<Redemption>> {
        let query = Query::update()
            .table(Redemptions::Table)
            .value(Redemptions::Status, RedemptionStatus::InProgress.as_str())
            .value(Redemptions::LockedAt, fmt_ts(locked_at))
            .and_where(Expr::col(Redemptions::Id).eq(id.to_string()))
            .and_where(Expr::col(Redemptions::Status).eq(RedemptionStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn confirm_and_debit(
        &self,
        id: Uuid,
        provider_payment_id: Option<&str>,
        provider_order_id: Option<&str>,
        debit: Option<NewLedgerEntry>,
        confirmed_at: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::confirm_in_txn(
            &mut conn,
            id,
            provider_payment_id,
            provider_order_id,
            debit.as_ref(),
            confirmed_at,
        )
        .await;

        match result {
            Ok(outcome) => {
                match outcome {
                    ConfirmOutcome::Confirmed(_) => {
                        sqlx::query("COMMIT").execute(&mut *conn).await?;
                    }
                    _ => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn cancel(&self, id: Uuid, canceled_at: DateTime<Utc>) -> Result<Option<Redemption>> {
        let query = Query::update()
            .table(Redemptions::Table)
            .value(Redemptions::Status, RedemptionStatus::Canceled.as_str())
            .value(Redemptions::CanceledAt, fmt_ts(canceled_at))
            .and_where(Expr::col(Redemptions::Id).eq(id.to_string()))
            .and_where(Expr::col(Redemptions::Status).eq(RedemptionStatus::Pending.as_str()))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        if done.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = Query::update()
            .table(Redemptions::Table)
            .value(Redemptions::Status, RedemptionStatus::Canceled.as_str())
            .value(Redemptions::CanceledAt, fmt_ts(now))
            .and_where(Expr::col(Redemptions::Status).is_in([
                RedemptionStatus::Pending.as_str(),
                RedemptionStatus::InProgress.as_str(),
            ]))
            .and_where(Expr::col(Redemptions::ExpiresAt).lte(fmt_ts(now)))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn find_by_provider_payment(
        &self,
        merchant_id: Uuid,
        provider_payment_id: &str,
    ) -> Result<Option<Redemption>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Redemptions::Table)
            .and_where(Expr::col(Redemptions::MerchantId).eq(merchant_id.to_string()))
            .and_where(Expr::col(Redemptions::ProviderPaymentId).eq(provider_payment_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| row_to_redemption(&r)).transpose()
    }

    async fn auto_confirm_candidates(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Redemption>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Redemptions::Table)
            .and_where(Expr::col(Redemptions::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(Redemptions::MerchantId).eq(merchant_id.to_string()))
            .and_where(Expr::col(Redemptions::Status).eq(RedemptionStatus::InProgress.as_str()))
            .and_where(Expr::col(Redemptions::ProviderPaymentId).is_null())
            .and_where(Expr::col(Redemptions::ExpiresAt).gt(fmt_ts(now)))
            .order_by(Redemptions::CreatedAt, Order::Asc)
            .order_by(Redemptions::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_redemption).collect()
    }
}

fn row_to_redemption(row: &SqliteRow) -> Result<Redemption> {
    let id: String = row.get("id");
    let customer_id: String = row.get("customer_id");
    let merchant_id: String = row.get("merchant_id");
    let reward_id: String = row.get("reward_id");
    let status: String = row.get("status");
    let expires_at: String = row.get("expires_at");
    let created_at: String = row.get("created_at");

    Ok(Redemption {
        id: Uuid::parse_str(&id)?,
        customer_id: Uuid::parse_str(&customer_id)?,
        merchant_id: Uuid::parse_str(&merchant_id)?,
        reward_id: Uuid::parse_str(&reward_id)?,
        status: RedemptionStatus::parse(&status)
            .ok_or_else(|| StorageError::corrupt("redemptions", format!("status: {status}")))?,
        token: row.get("token"),
        pin: row.get("pin"),
        expires_at: parse_ts(&expires_at)?,
        locked_at: parse_ts_opt(row.get("locked_at"))?,
        confirmed_at: parse_ts_opt(row.get("confirmed_at"))?,
        canceled_at: parse_ts_opt(row.get("canceled_at"))?,
        provider_payment_id: row.get("provider_payment_id"),
        provider_order_id: row.get("provider_order_id"),
        points_deducted: row.get("points_deducted"),
        created_at: parse_ts(&created_at)?,
    })
}
