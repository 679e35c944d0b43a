//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building. The partial unique indexes below are the dedup mutexes the
//! concurrency model relies on: conflicting writers lose the insert and
//! read back the winner.

use sea_query::Iden;

/// Ledger entries table schema.
#[derive(Iden)]
pub enum LedgerEntries {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "kind"]
    Kind,
    #[iden = "points"]
    Points,
    #[iden = "external_ref"]
    ExternalRef,
    #[iden = "redemption_id"]
    RedemptionId,
    #[iden = "note"]
    Note,
    #[iden = "created_at"]
    CreatedAt,
}

/// Balance snapshots table schema.
#[derive(Iden)]
pub enum BalanceSnapshots {
    Table,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "balance"]
    Balance,
    #[iden = "computed_at"]
    ComputedAt,
}

/// Redemptions table schema.
#[derive(Iden)]
pub enum Redemptions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "reward_id"]
    RewardId,
    #[iden = "status"]
    Status,
    #[iden = "token"]
    Token,
    #[iden = "pin"]
    Pin,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "locked_at"]
    LockedAt,
    #[iden = "confirmed_at"]
    ConfirmedAt,
    #[iden = "canceled_at"]
    CanceledAt,
    #[iden = "provider_payment_id"]
    ProviderPaymentId,
    #[iden = "provider_order_id"]
    ProviderOrderId,
    #[iden = "points_deducted"]
    PointsDeducted,
    #[iden = "created_at"]
    CreatedAt,
}

/// Webhook events table schema.
#[derive(Iden)]
pub enum WebhookEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "provider"]
    Provider,
    #[iden = "external_id"]
    ExternalId,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "processed_at"]
    ProcessedAt,
    #[iden = "received_at"]
    ReceivedAt,
}

/// Rewards table schema.
#[derive(Iden)]
pub enum Rewards {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "name"]
    Name,
    #[iden = "kind"]
    Kind,
    #[iden = "cost_points"]
    CostPoints,
    #[iden = "item_threshold"]
    ItemThreshold,
    #[iden = "enabled"]
    Enabled,
}

/// Earn rules table schema.
#[derive(Iden)]
pub enum EarnRules {
    Table,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "rule_type"]
    RuleType,
    #[iden = "rate"]
    Rate,
    #[iden = "rounding"]
    Rounding,
    #[iden = "min_subtotal_minor"]
    MinSubtotalMinor,
    #[iden = "enabled"]
    Enabled,
}

/// Merchant locations table schema.
#[derive(Iden)]
pub enum MerchantLocations {
    Table,
    #[iden = "provider"]
    Provider,
    #[iden = "location_id"]
    LocationId,
    #[iden = "merchant_id"]
    MerchantId,
}

/// Customer links table schema.
#[derive(Iden)]
pub enum CustomerLinks {
    Table,
    #[iden = "provider"]
    Provider,
    #[iden = "provider_customer_id"]
    ProviderCustomerId,
    #[iden = "merchant_id"]
    MerchantId,
    #[iden = "customer_id"]
    CustomerId,
}

/// SQL for creating the ledger tables.
pub const CREATE_LEDGER_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    points INTEGER NOT NULL,
    external_ref TEXT,
    redemption_id TEXT,
    note TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_external_ref
    ON ledger_entries(merchant_id, kind, external_ref)
    WHERE external_ref IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_ledger_pair
    ON ledger_entries(customer_id, merchant_id);

CREATE TABLE IF NOT EXISTS balance_snapshots (
    customer_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    balance INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (customer_id, merchant_id)
);
"#;

/// SQL for creating the redemptions table.
pub const CREATE_REDEMPTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS redemptions (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    reward_id TEXT NOT NULL,
    status TEXT NOT NULL,
    token TEXT NOT NULL UNIQUE,
    pin TEXT NOT NULL UNIQUE,
    expires_at TEXT NOT NULL,
    locked_at TEXT,
    confirmed_at TEXT,
    canceled_at TEXT,
    provider_payment_id TEXT,
    provider_order_id TEXT,
    points_deducted INTEGER,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_redemptions_provider_payment
    ON redemptions(merchant_id, provider_payment_id)
    WHERE provider_payment_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_redemptions_pair_status
    ON redemptions(customer_id, merchant_id, status);
"#;

/// SQL for creating the webhook events table.
pub const CREATE_WEBHOOK_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_events (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    processed_at TEXT,
    received_at TEXT NOT NULL,
    UNIQUE (provider, external_id)
);
"#;

/// SQL for creating the catalog/directory tables. These rows are owned by
/// onboarding and sync collaborators; this crate only reads them.
pub const CREATE_CATALOG_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS rewards (
    id TEXT PRIMARY KEY,
    merchant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    cost_points INTEGER,
    item_threshold INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS earn_rules (
    merchant_id TEXT PRIMARY KEY,
    rule_type TEXT NOT NULL,
    rate REAL NOT NULL,
    rounding TEXT NOT NULL,
    min_subtotal_minor INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS merchant_locations (
    provider TEXT NOT NULL,
    location_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    PRIMARY KEY (provider, location_id)
);

CREATE TABLE IF NOT EXISTS customer_links (
    provider TEXT NOT NULL,
    provider_customer_id TEXT NOT NULL,
    merchant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    PRIMARY KEY (provider, provider_customer_id, merchant_id)
);
"#;
