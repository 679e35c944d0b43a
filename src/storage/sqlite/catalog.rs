//! SQLite reward catalog and directory lookups.
//!
//! The rows are owned by onboarding/catalog/sync collaborators; the core
//! only reads them. Upsert methods exist so those collaborators (and tests)
//! have a write path.

use async_trait::async_trait;
use sea_query::{Asterisk, Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::{Reward, RewardKind};
use crate::interfaces::{Directory, Result, RewardCatalog, StorageError};
use crate::points::{EarnRule, RoundingPolicy};
use crate::storage::schema::{CustomerLinks, EarnRules, MerchantLocations, Rewards};

const RULE_POINTS_PER_CURRENCY_UNIT: &str = "points_per_currency_unit";
const KIND_POINTS_COST: &str = "points_cost";
const KIND_ITEM_THRESHOLD: &str = "item_threshold";

/// SQLite implementation of RewardCatalog and Directory.
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    /// Create a new SQLite catalog.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a reward definition.
    pub async fn put_reward(&self, reward: &Reward) -> Result<()> {
        let (kind, cost_points, item_threshold) = match reward.kind {
            RewardKind::PointsCost { cost } => (KIND_POINTS_COST, Some(cost), None),
            RewardKind::ItemThreshold { threshold } => {
                (KIND_ITEM_THRESHOLD, None, Some(threshold as i64))
            }
        };

        let query = Query::insert()
            .into_table(Rewards::Table)
            .columns([
                Rewards::Id,
                Rewards::MerchantId,
                Rewards::Name,
                Rewards::Kind,
                Rewards::CostPoints,
                Rewards::ItemThreshold,
                Rewards::Enabled,
            ])
            .values_panic([
                reward.id.to_string().into(),
                reward.merchant_id.to_string().into(),
                reward.name.clone().into(),
                kind.into(),
                cost_points.into(),
                item_threshold.into(),
                (reward.enabled as i64).into(),
            ])
            .on_conflict(
                OnConflict::column(Rewards::Id)
                    .update_columns([
                        Rewards::MerchantId,
                        Rewards::Name,
                        Rewards::Kind,
                        Rewards::CostPoints,
                        Rewards::ItemThreshold,
                        Rewards::Enabled,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace a merchant's earn rule row.
    ///
    /// `rule_type` and `rounding` are stored as strings so the sync
    /// collaborator can write configurations this crate version does not
    /// know yet; reads validate them.
    pub async fn put_earn_rule(
        &self,
        merchant_id: Uuid,
        rule_type: &str,
        rate: f64,
        rounding: &str,
        min_subtotal_minor: i64,
        enabled: bool,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(EarnRules::Table)
            .columns([
                EarnRules::MerchantId,
                EarnRules::RuleType,
                EarnRules::Rate,
                EarnRules::Rounding,
                EarnRules::MinSubtotalMinor,
                EarnRules::Enabled,
            ])
            .values_panic([
                merchant_id.to_string().into(),
                rule_type.into(),
                rate.into(),
                rounding.into(),
                min_subtotal_minor.into(),
                (enabled as i64).into(),
            ])
            .on_conflict(
                OnConflict::column(EarnRules::MerchantId)
                    .update_columns([
                        EarnRules::RuleType,
                        EarnRules::Rate,
                        EarnRules::Rounding,
                        EarnRules::MinSubtotalMinor,
                        EarnRules::Enabled,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Map a provider-side location to a merchant.
    pub async fn put_location(
        &self,
        provider: &str,
        location_id: &str,
        merchant_id: Uuid,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(MerchantLocations::Table)
            .columns([
                MerchantLocations::Provider,
                MerchantLocations::LocationId,
                MerchantLocations::MerchantId,
            ])
            .values_panic([
                provider.into(),
                location_id.into(),
                merchant_id.to_string().into(),
            ])
            .on_conflict(
                OnConflict::columns([MerchantLocations::Provider, MerchantLocations::LocationId])
                    .update_column(MerchantLocations::MerchantId)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Link a provider-side customer id to a local customer for a merchant.
    pub async fn put_customer_link(
        &self,
        provider: &str,
        provider_customer_id: &str,
        merchant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(CustomerLinks::Table)
            .columns([
                CustomerLinks::Provider,
                CustomerLinks::ProviderCustomerId,
                CustomerLinks::MerchantId,
                CustomerLinks::CustomerId,
            ])
            .values_panic([
                provider.into(),
                provider_customer_id.into(),
                merchant_id.to_string().into(),
                customer_id.to_string().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    CustomerLinks::Provider,
                    CustomerLinks::ProviderCustomerId,
                    CustomerLinks::MerchantId,
                ])
                .update_column(CustomerLinks::CustomerId)
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RewardCatalog for SqliteCatalog {
    async fn reward(&self, reward_id: Uuid) -> Result<Option<Reward>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Rewards::Table)
            .and_where(Expr::col(Rewards::Id).eq(reward_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let id: String = row.get("id");
        let merchant_id: String = row.get("merchant_id");
        let kind: String = row.get("kind");
        let kind = match kind.as_str() {
            KIND_POINTS_COST => RewardKind::PointsCost {
                cost: row.get::<Option<i64>, _>("cost_points").ok_or_else(|| {
                    StorageError::corrupt("rewards", "points_cost reward without cost_points")
                })?,
            },
            KIND_ITEM_THRESHOLD => RewardKind::ItemThreshold {
                threshold: row.get::<Option<i64>, _>("item_threshold").ok_or_else(|| {
                    StorageError::corrupt("rewards", "item_threshold reward without threshold")
                })? as u32,
            },
            other => {
                return Err(StorageError::corrupt("rewards", format!("kind: {other}")));
            }
        };

        Ok(Some(Reward {
            id: Uuid::parse_str(&id)?,
            merchant_id: Uuid::parse_str(&merchant_id)?,
            name: row.get("name"),
            kind,
            enabled: row.get::<i64, _>("enabled") != 0,
        }))
    }

    async fn earn_rule(&self, merchant_id: Uuid) -> Result<Option<EarnRule>> {
        let query = Query::select()
            .column(Asterisk)
            .from(EarnRules::Table)
            .and_where(Expr::col(EarnRules::MerchantId).eq(merchant_id.to_string()))
            .and_where(Expr::col(EarnRules::Enabled).eq(1))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let rule_type: String = row.get("rule_type");
        if rule_type != RULE_POINTS_PER_CURRENCY_UNIT {
            return Err(StorageError::corrupt(
                "earn_rules",
                format!("rule_type: {rule_type}"),
            ));
        }

        let rounding: String = row.get("rounding");
        Ok(Some(EarnRule::PointsPerCurrencyUnit {
            rate: row.get("rate"),
            rounding: RoundingPolicy::parse_or_floor(&rounding),
            min_subtotal_minor: row.get("min_subtotal_minor"),
        }))
    }
}

#[async_trait]
impl Directory for SqliteCatalog {
    async fn merchant_for_location(
        &self,
        provider: &str,
        location_id: &str,
    ) -> Result<Option<Uuid>> {
        let query = Query::select()
            .column(MerchantLocations::MerchantId)
            .from(MerchantLocations::Table)
            .and_where(Expr::col(MerchantLocations::Provider).eq(provider))
            .and_where(Expr::col(MerchantLocations::LocationId).eq(location_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| {
            let merchant_id: String = r.get("merchant_id");
            Ok(Uuid::parse_str(&merchant_id)?)
        })
        .transpose()
    }

    async fn customer_for_provider(
        &self,
        provider: &str,
        provider_customer_id: &str,
        merchant_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let query = Query::select()
            .column(CustomerLinks::CustomerId)
            .from(CustomerLinks::Table)
            .and_where(Expr::col(CustomerLinks::Provider).eq(provider))
            .and_where(Expr::col(CustomerLinks::ProviderCustomerId).eq(provider_customer_id))
            .and_where(Expr::col(CustomerLinks::MerchantId).eq(merchant_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| {
            let customer_id: String = r.get("customer_id");
            Ok(Uuid::parse_str(&customer_id)?)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::test_pool;

    #[tokio::test]
    async fn reward_round_trips() {
        let catalog = SqliteCatalog::new(test_pool().await);
        let reward = Reward {
            id: Uuid::new_v4(),
            merchant_id: Uuid::new_v4(),
            name: "free espresso".into(),
            kind: RewardKind::PointsCost { cost: 100 },
            enabled: true,
        };

        catalog.put_reward(&reward).await.unwrap();
        assert_eq!(catalog.reward(reward.id).await.unwrap().unwrap(), reward);
        assert!(catalog.reward(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_earn_rule_is_absent() {
        let catalog = SqliteCatalog::new(test_pool().await);
        let merchant = Uuid::new_v4();

        catalog
            .put_earn_rule(merchant, "points_per_currency_unit", 10.0, "floor", 0, false)
            .await
            .unwrap();
        assert!(catalog.earn_rule(merchant).await.unwrap().is_none());

        catalog
            .put_earn_rule(merchant, "points_per_currency_unit", 10.0, "floor", 0, true)
            .await
            .unwrap();
        assert!(catalog.earn_rule(merchant).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_rule_type_is_corrupt() {
        let catalog = SqliteCatalog::new(test_pool().await);
        let merchant = Uuid::new_v4();

        catalog
            .put_earn_rule(merchant, "stamps_per_visit", 1.0, "floor", 0, true)
            .await
            .unwrap();
        assert!(matches!(
            catalog.earn_rule(merchant).await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_rounding_falls_back_to_floor() {
        let catalog = SqliteCatalog::new(test_pool().await);
        let merchant = Uuid::new_v4();

        catalog
            .put_earn_rule(merchant, "points_per_currency_unit", 2.0, "half_even", 0, true)
            .await
            .unwrap();
        let rule = catalog.earn_rule(merchant).await.unwrap().unwrap();
        let EarnRule::PointsPerCurrencyUnit { rounding, .. } = rule;
        assert_eq!(rounding, RoundingPolicy::Floor);
    }

    #[tokio::test]
    async fn directory_lookups() {
        let catalog = SqliteCatalog::new(test_pool().await);
        let merchant = Uuid::new_v4();
        let customer = Uuid::new_v4();

        catalog.put_location("square", "loc-1", merchant).await.unwrap();
        catalog
            .put_customer_link("square", "cust-abc", merchant, customer)
            .await
            .unwrap();

        assert_eq!(
            catalog.merchant_for_location("square", "loc-1").await.unwrap(),
            Some(merchant)
        );
        assert_eq!(
            catalog.merchant_for_location("square", "loc-2").await.unwrap(),
            None
        );
        assert_eq!(
            catalog
                .customer_for_provider("square", "cust-abc", merchant)
                .await
                .unwrap(),
            Some(customer)
        );
        // Link is scoped to the merchant.
        assert_eq!(
            catalog
                .customer_for_provider("square", "cust-abc", Uuid::new_v4())
                .await
                .unwrap(),
            None
        );
    }
}
