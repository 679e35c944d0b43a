//! Read-only lookups against collaborator-owned data.
//!
//! Rewards, earn rules, location mappings and provider customer links are
//! written by onboarding/catalog/sync collaborators outside this crate;
//! the core only reads them.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::Reward;
use crate::points::EarnRule;

use super::Result;

/// Reward definitions and the merchant's earn-rule configuration.
#[async_trait]
pub trait RewardCatalog: Send + Sync {
    async fn reward(&self, reward_id: Uuid) -> Result<Option<Reward>>;

    /// The merchant's enabled earn rule, if one is configured. Disabled
    /// rules are reported as absent; malformed rows are storage errors.
    async fn earn_rule(&self, merchant_id: Uuid) -> Result<Option<EarnRule>>;
}

/// Merchant and customer identity resolution for inbound provider events.
#[async_trait]
pub trait Directory: Send + Sync {
    /// The merchant owning a provider-side location, if known.
    async fn merchant_for_location(
        &self,
        provider: &str,
        location_id: &str,
    ) -> Result<Option<Uuid>>;

    /// The local customer linked to a provider-side customer id for this
    /// merchant, if a link exists.
    async fn customer_for_provider(
        &self,
        provider: &str,
        provider_customer_id: &str,
        merchant_id: Uuid,
    ) -> Result<Option<Uuid>>;
}
