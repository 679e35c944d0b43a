//! SQLite LedgerStore implementation.

use async_trait::async_trait;
use sea_query::{Asterisk, Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::domain::{EntryKind, LedgerEntry};
use crate::interfaces::{BalanceSnapshot, LedgerStore, LedgerWrite, NewLedgerEntry, Result};
use crate::interfaces::StorageError;
use crate::storage::schema::{BalanceSnapshots, LedgerEntries};
use crate::storage::{fmt_ts, parse_ts};

use super::is_unique_violation;

/// SQLite implementation of LedgerStore.
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Create a new SQLite ledger store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn insert_sql(entry: &NewLedgerEntry) -> String {
        Query::insert()
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
                entry.id.to_string().into(),
                entry.customer_id.to_string().into(),
                entry.merchant_id.to_string().into(),
                entry.kind.as_str().into(),
                entry.points.into(),
                entry.external_ref.clone().into(),
                entry.redemption_id.map(|id| id.to_string()).into(),
                entry.note.clone().into(),
                fmt_ts(entry.created_at).into(),
            ])
            .to_string(SqliteQueryBuilder)
    }

    fn existing_sql(merchant_id: Uuid, kind: EntryKind, external_ref: &str) -> String {
        Query::select()
            .column(Asterisk)
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::MerchantId).eq(merchant_id.to_string()))
            .and_where(Expr::col(LedgerEntries::Kind).eq(kind.as_str()))
            .and_where(Expr::col(LedgerEntries::ExternalRef).eq(external_ref))
            .to_string(SqliteQueryBuilder)
    }

    fn sum_sql(customer_id: Uuid, merchant_id: Uuid) -> String {
        Query::select()
            .expr(Expr::col(LedgerEntries::Points).sum())
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(LedgerEntries::MerchantId).eq(merchant_id.to_string()))
            .to_string(SqliteQueryBuilder)
    }

    /// The prior entry for the same idempotency triple, if one exists.
    async fn find_existing(
        conn: &mut SqliteConnection,
        entry: &NewLedgerEntry,
    ) -> Result<Option<LedgerEntry>> {
        let Some(ref external_ref) = entry.external_ref else {
            return Ok(None);
        };
        let query = Self::existing_sql(entry.merchant_id, entry.kind, external_ref);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// Credits race only on the idempotency index, so a plain insert with
    /// conflict read-back suffices.
    async fn append_credit(&self, entry: NewLedgerEntry) -> Result<LedgerWrite> {
        let query = Self::insert_sql(&entry);
        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(LedgerWrite::Fresh(materialize(entry))),
            Err(e) if is_unique_violation(&e) => {
                let mut conn = self.pool.acquire().await?;
                match Self::find_existing(&mut conn, &entry).await? {
                    Some(existing) => Ok(LedgerWrite::Existing(existing)),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Debits check the balance immediately before the write, inside the
    /// same transaction, so a concurrent debit cannot take the pair
    /// negative.
    async fn append_debit(&self, entry: NewLedgerEntry) -> Result<LedgerWrite> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::debit_in_txn(&mut conn, &entry).await;

        match result {
            Ok(write) => {
                match write {
                    LedgerWrite::Fresh(_) => {
                        sqlx::query("COMMIT").execute(&mut *conn).await?;
                    }
                    _ => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    }
                }
                Ok(write)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn debit_in_txn(
        conn: &mut SqliteConnection,
        entry: &NewLedgerEntry,
    ) -> Result<LedgerWrite> {
        if let Some(existing) = Self::find_existing(conn, entry).await? {
            return Ok(LedgerWrite::Existing(existing));
        }

        let query = Self::sum_sql(entry.customer_id, entry.merchant_id);
        let row = sqlx::query(&query).fetch_one(&mut *conn).await?;
        let available: i64 = row.get::<Option<i64>, _>(0).unwrap_or(0);

        if available + entry.points < 0 {
            return Ok(LedgerWrite::InsufficientBalance {
                required: -entry.points,
                available,
            });
        }

        let query = Self::insert_sql(entry);
        match sqlx::query(&query).execute(&mut *conn).await {
            Ok(_) => Ok(LedgerWrite::Fresh(materialize(entry.clone()))),
            Err(e) if is_unique_violation(&e) => match Self::find_existing(conn, entry).await? {
                Some(existing) => Ok(LedgerWrite::Existing(existing)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append(&self, entry: NewLedgerEntry) -> Result<LedgerWrite> {
        if entry.points < 0 {
            self.append_debit(entry).await
        } else {
            self.append_credit(entry).await
        }
    }

    async fn sum_points(&self, customer_id: Uuid, merchant_id: Uuid) -> Result<i64> {
        let query = Self::sum_sql(customer_id, merchant_id);
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(row.get::<Option<i64>, _>(0).unwrap_or(0))
    }

    async fn entries_for_pair(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Vec<LedgerEntry>> {
        let query = Query::select()
            .column(Asterisk)
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(LedgerEntries::MerchantId).eq(merchant_id.to_string()))
            .order_by(LedgerEntries::CreatedAt, Order::Asc)
            .order_by(LedgerEntries::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn refresh_snapshot(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
        computed_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<BalanceSnapshot> {
        let balance = self.sum_points(customer_id, merchant_id).await?;

        let query = Query::insert()
            .into_table(BalanceSnapshots::Table)
            .columns([
                BalanceSnapshots::CustomerId,
                BalanceSnapshots::MerchantId,
                BalanceSnapshots::Balance,
                BalanceSnapshots::ComputedAt,
            ])
            .values_panic([
                customer_id.to_string().into(),
                merchant_id.to_string().into(),
                balance.into(),
                fmt_ts(computed_at).into(),
            ])
            .on_conflict(
                OnConflict::columns([BalanceSnapshots::CustomerId, BalanceSnapshots::MerchantId])
                    .update_columns([BalanceSnapshots::Balance, BalanceSnapshots::ComputedAt])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(BalanceSnapshot {
            customer_id,
            merchant_id,
            balance,
            computed_at,
        })
    }

    async fn snapshot(
        &self,
        customer_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<Option<BalanceSnapshot>> {
        let query = Query::select()
            .column(Asterisk)
            .from(BalanceSnapshots::Table)
            .and_where(Expr::col(BalanceSnapshots::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(BalanceSnapshots::MerchantId).eq(merchant_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| {
            let customer: String = r.get("customer_id");
            let merchant: String = r.get("merchant_id");
            let computed_at: String = r.get("computed_at");
            Ok(BalanceSnapshot {
                customer_id: Uuid::parse_str(&customer)?,
                merchant_id: Uuid::parse_str(&merchant)?,
                balance: r.get("balance"),
                computed_at: parse_ts(&computed_at)?,
            })
        })
        .transpose()
    }
}

/// A NewLedgerEntry that was just written, as the domain record.
fn materialize(entry: NewLedgerEntry) -> LedgerEntry {
    LedgerEntry {
        id: entry.id,
        customer_id: entry.customer_id,
        merchant_id: entry.merchant_id,
        kind: entry.kind,
        points: entry.points,
        external_ref: entry.external_ref,
        redemption_id: entry.redemption_id,
        note: entry.note,
        created_at: entry.created_at,
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<LedgerEntry> {
    let id: String = row.get("id");
    let customer_id: String = row.get("customer_id");
    let merchant_id: String = row.get("merchant_id");
    let kind: String = row.get("kind");
    let redemption_id: Option<String> = row.get("redemption_id");
    let created_at: String = row.get("created_at");

    Ok(LedgerEntry {
        id: Uuid::parse_str(&id)?,
        customer_id: Uuid::parse_str(&customer_id)?,
        merchant_id: Uuid::parse_str(&merchant_id)?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| StorageError::corrupt("ledger_entries", format!("kind: {kind}")))?,
        points: row.get("points"),
        external_ref: row.get("external_ref"),
        redemption_id: redemption_id.map(|s| Uuid::parse_str(&s)).transpose()?,
        note: row.get("note"),
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::storage::sqlite::test_pool;

    fn earn(customer: Uuid, merchant: Uuid, points: i64, external_ref: Option<&str>) -> NewLedgerEntry {
        NewLedgerEntry {
            id: Uuid::new_v4(),
            customer_id: customer,
            merchant_id: merchant,
            kind: EntryKind::Earn,
            points,
            external_ref: external_ref.map(String::from),
            redemption_id: None,
            note: None,
            created_at: Utc::now(),
        }
    }

    fn redeem(customer: Uuid, merchant: Uuid, points: i64, external_ref: &str) -> NewLedgerEntry {
        NewLedgerEntry {
            id: Uuid::new_v4(),
            customer_id: customer,
            merchant_id: merchant,
            kind: EntryKind::Redeem,
            points: -points,
            external_ref: Some(external_ref.to_string()),
            redemption_id: None,
            note: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_and_sum() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        let write = store.append(earn(customer, merchant, 100, None)).await.unwrap();
        assert!(matches!(write, LedgerWrite::Fresh(_)));
        store.append(earn(customer, merchant, 50, None)).await.unwrap();

        assert_eq!(store.sum_points(customer, merchant).await.unwrap(), 150);
        assert_eq!(store.sum_points(customer, Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_external_ref_returns_winner() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        let first = store
            .append(earn(customer, merchant, 200, Some("square:payment:p1")))
            .await
            .unwrap();
        let LedgerWrite::Fresh(first) = first else {
            panic!("expected fresh write");
        };

        let second = store
            .append(earn(customer, merchant, 200, Some("square:payment:p1")))
            .await
            .unwrap();
        let LedgerWrite::Existing(second) = second else {
            panic!("expected existing entry");
        };

        assert_eq!(first.id, second.id);
        assert_eq!(store.sum_points(customer, merchant).await.unwrap(), 200);
        assert_eq!(
            store.entries_for_pair(customer, merchant).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn same_ref_different_kind_is_distinct() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        store
            .append(earn(customer, merchant, 100, Some("ref-1")))
            .await
            .unwrap();
        let write = store.append(redeem(customer, merchant, 40, "ref-1")).await.unwrap();
        assert!(matches!(write, LedgerWrite::Fresh(_)));
        assert_eq!(store.sum_points(customer, merchant).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn debit_checks_balance() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        store.append(earn(customer, merchant, 30, None)).await.unwrap();

        let write = store.append(redeem(customer, merchant, 100, "r1")).await.unwrap();
        match write {
            LedgerWrite::InsufficientBalance { required, available } => {
                assert_eq!(required, 100);
                assert_eq!(available, 30);
            }
            other => panic!("expected insufficient balance, got {other:?}"),
        }
        // Nothing was written.
        assert_eq!(store.sum_points(customer, merchant).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn debit_replay_returns_winner_without_double_debit() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        store.append(earn(customer, merchant, 500, None)).await.unwrap();
        let first = store.append(redeem(customer, merchant, 100, "redemption:a")).await.unwrap();
        let LedgerWrite::Fresh(first) = first else {
            panic!("expected fresh debit");
        };

        let replay = store.append(redeem(customer, merchant, 100, "redemption:a")).await.unwrap();
        let LedgerWrite::Existing(replay) = replay else {
            panic!("expected existing debit");
        };
        assert_eq!(first.id, replay.id);
        assert_eq!(store.sum_points(customer, merchant).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn snapshot_recompute() {
        let store = SqliteLedgerStore::new(test_pool().await);
        let (customer, merchant) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(store.snapshot(customer, merchant).await.unwrap().is_none());

        store.append(earn(customer, merchant, 250, None)).await.unwrap();
        let snap = store
            .refresh_snapshot(customer, merchant, Utc::now())
            .await
            .unwrap();
        assert_eq!(snap.balance, 250);

        store.append(earn(customer, merchant, 50, None)).await.unwrap();
        // Stale until recomputed.
        assert_eq!(store.snapshot(customer, merchant).await.unwrap().unwrap().balance, 250);
        let snap = store
            .refresh_snapshot(customer, merchant, Utc::now())
            .await
            .unwrap();
        assert_eq!(snap.balance, 300);
    }
}
