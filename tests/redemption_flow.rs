//! End-to-end flow against a file-backed store: earn via webhook, redeem
//! via token, auto-confirm, and expiry sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use tally::config::{RedemptionConfig, StorageConfig};
use tally::domain::{EventStatus, RedemptionStatus, Reward, RewardKind};
use tally::interfaces::{LedgerStore, NewWebhookEvent, RedemptionStore, WebhookEventStore};
use tally::ledger::{BalanceProjector, PointsLedger};
use tally::redemption::RedemptionEngine;
use tally::storage::{init_storage, Stores};
use tally::utils::{Clock, ManualClock};
use tally::webhook::{EventOutcome, WebhookProcessor};

struct App {
    stores: Stores,
    ledger: Arc<PointsLedger>,
    projector: BalanceProjector,
    engine: Arc<RedemptionEngine>,
    processor: WebhookProcessor,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

async fn app() -> App {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = StorageConfig {
        storage_type: "sqlite".to_string(),
        path: dir
            .path()
            .join("tally.db")
            .to_string_lossy()
            .into_owned(),
    };

    let stores = init_storage(&storage).await.expect("storage");
    let clock = Arc::new(ManualClock::new(Utc::now()));

    let ledger = Arc::new(PointsLedger::new(stores.ledger.clone(), clock.clone()));
    let projector = BalanceProjector::new(stores.ledger.clone(), clock.clone());
    let engine = Arc::new(RedemptionEngine::new(
        stores.redemptions.clone(),
        stores.ledger.clone(),
        stores.catalog.clone(),
        clock.clone(),
        RedemptionConfig::default(),
    ));
    let processor = WebhookProcessor::new(
        stores.events.clone(),
        stores.catalog.clone(),
        stores.catalog.clone(),
        stores.redemptions.clone(),
        ledger.clone(),
        engine.clone(),
        clock.clone(),
    );

    App {
        stores,
        ledger,
        projector,
        engine,
        processor,
        clock,
        _dir: dir,
    }
}

async fn seed_program(app: &App, merchant: Uuid, customer: Uuid) -> Reward {
    let reward = Reward {
        id: Uuid::new_v4(),
        merchant_id: merchant,
        name: "free pastry".into(),
        kind: RewardKind::PointsCost { cost: 100 },
        enabled: true,
    };
    app.stores.catalog.put_reward(&reward).await.unwrap();
    app.stores
        .catalog
        .put_location("square", "loc-main", merchant)
        .await
        .unwrap();
    app.stores
        .catalog
        .put_customer_link("square", "sq-cust-1", merchant, customer)
        .await
        .unwrap();
    app.stores
        .catalog
        .put_earn_rule(merchant, "points_per_currency_unit", 10.0, "floor", 0, true)
        .await
        .unwrap();
    reward
}

async fn deliver_payment(app: &App, external_id: &str, payment_id: &str, amount: i64) -> Uuid {
    let outcome = app
        .stores
        .events
        .ingest(NewWebhookEvent {
            id: Uuid::new_v4(),
            provider: "square".into(),
            external_id: external_id.into(),
            event_type: "payment.updated".into(),
            payload: serde_json::json!({
                "payment_id": payment_id,
                "status": "COMPLETED",
                "amount_minor": amount,
                "location_id": "loc-main",
                "customer_id": "sq-cust-1",
            })
            .to_string(),
            received_at: app.clock.now(),
        })
        .await
        .unwrap();
    outcome.event().id
}

#[tokio::test]
async fn earn_redeem_and_sweep() {
    let app = app().await;
    let merchant = Uuid::new_v4();
    let customer = Uuid::new_v4();
    let reward = seed_program(&app, merchant, customer).await;

    // A 50.00 payment earns 500 points.
    let event_id = deliver_payment(&app, "evt-1", "pay-1", 5000).await;
    let outcome = app.processor.process_event(event_id).await.unwrap();
    assert_eq!(
        outcome,
        EventOutcome::Processed {
            credited_points: 500,
            auto_confirmed: None,
        }
    );
    assert_eq!(app.ledger.balance(customer, merchant).await.unwrap(), 500);

    // Redelivery of the same event changes nothing.
    let replay_id = deliver_payment(&app, "evt-1", "pay-1", 5000).await;
    assert_eq!(replay_id, event_id);
    assert_eq!(
        app.processor.process_event(replay_id).await.unwrap(),
        EventOutcome::AlreadyTerminal
    );
    assert_eq!(app.ledger.balance(customer, merchant).await.unwrap(), 500);

    // Customer starts a redemption; merchant verifies the token.
    let redemption = app.engine.create(customer, merchant, reward.id).await.unwrap();
    assert_eq!(redemption.status, RedemptionStatus::Pending);
    assert_eq!(
        redemption.expires_at,
        redemption.created_at + Duration::minutes(5)
    );

    let locked = app
        .engine
        .verify_and_lock(merchant, &redemption.token)
        .await
        .unwrap();
    assert_eq!(locked.status, RedemptionStatus::InProgress);

    let confirmed = app.engine.confirm(redemption.id, None, None).await.unwrap();
    assert_eq!(confirmed.status, RedemptionStatus::Confirmed);
    assert_eq!(confirmed.points_deducted, Some(100));
    assert_eq!(app.ledger.balance(customer, merchant).await.unwrap(), 400);
    assert_eq!(app.projector.refresh(customer, merchant).await.unwrap().balance, 400);

    // An abandoned redemption is swept after its deadline with no ledger
    // effect.
    let abandoned = app.engine.create(customer, merchant, reward.id).await.unwrap();
    app.clock.advance(Duration::minutes(6));
    assert_eq!(app.engine.sweep_expired().await.unwrap(), 1);
    assert_eq!(
        app.stores
            .redemptions
            .find_by_id(abandoned.id)
            .await
            .unwrap()
            .unwrap()
            .status,
        RedemptionStatus::Canceled
    );
    assert_eq!(app.ledger.balance(customer, merchant).await.unwrap(), 400);
}

#[tokio::test]
async fn payment_auto_confirms_locked_redemption() {
    let app = app().await;
    let merchant = Uuid::new_v4();
    let customer = Uuid::new_v4();
    let reward = seed_program(&app, merchant, customer).await;

    // Earn enough to redeem.
    let event_id = deliver_payment(&app, "evt-seed", "pay-seed", 5000).await;
    app.processor.process_event(event_id).await.unwrap();

    // Customer presents the token; the merchant locks it and rings up the
    // purchase, whose payment webhook confirms the redemption.
    let redemption = app.engine.create(customer, merchant, reward.id).await.unwrap();
    app.engine
        .verify_and_lock(merchant, &redemption.token)
        .await
        .unwrap();

    let event_id = deliver_payment(&app, "evt-pay", "pay-2", 1200).await;
    let outcome = app.processor.process_event(event_id).await.unwrap();
    assert_eq!(
        outcome,
        EventOutcome::Processed {
            credited_points: 120,
            auto_confirmed: Some(redemption.id),
        }
    );

    let confirmed = app
        .stores
        .redemptions
        .find_by_id(redemption.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.status, RedemptionStatus::Confirmed);
    assert_eq!(confirmed.provider_payment_id.as_deref(), Some("pay-2"));

    // 500 earned + 120 earned - 100 redeemed.
    assert_eq!(app.ledger.balance(customer, merchant).await.unwrap(), 520);

    // Ledger sum and event record agree with what happened.
    assert_eq!(
        app.stores
            .ledger
            .sum_points(customer, merchant)
            .await
            .unwrap(),
        520
    );
    assert_eq!(
        app.stores
            .events
            .find_by_id(event_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        EventStatus::Processed
    );
}
