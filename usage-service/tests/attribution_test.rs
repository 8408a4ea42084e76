//! Event attribution integration tests for usage-service.

mod common;

use common::*;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::time::{Duration, Instant};
use usage_service::models::{
    AggregationType, Event, FeatureUsage, Meter, MeterAggregation, MeterFilter, PriceStatus,
    SubscriptionStatus, WorkflowAction, WorkflowActionConfig, WorkflowConfig,
    CUSTOMER_ONBOARDING_WORKFLOW,
};
use usage_service::services::attribution::{attributor_for, AttributionContext};
use usage_service::services::{TrackingStrategy, UsageAttributor};

fn sorted(mut records: Vec<FeatureUsage>) -> Vec<FeatureUsage> {
    records.sort_by(|a, b| a.sub_line_item_id.cmp(&b.sub_line_item_id));
    records
}

async fn attribute(
    harness: &TestHarness,
    strategy: TrackingStrategy,
    event: &Event,
) -> Result<Vec<FeatureUsage>, AppError> {
    attributor_for(strategy, harness.context())
        .attribute(event)
        .await
}

/// Runs both strategies on `event` and requires identical records.
async fn assert_strategies_agree(harness: &TestHarness, event: &Event) -> Vec<FeatureUsage> {
    let broad = sorted(attribute(harness, TrackingStrategy::V1, event).await.unwrap());
    let targeted = sorted(attribute(harness, TrackingStrategy::V2, event).await.unwrap());
    assert_eq!(broad, targeted, "strategies diverged on event {}", event.id);
    targeted
}

fn line_item_ids(records: &[FeatureUsage]) -> Vec<&str> {
    records.iter().map(|r| r.sub_line_item_id.as_str()).collect()
}

fn count_meter(id: &str, event_name: &str, filters: &[(&str, &str)]) -> Meter {
    let mut m = meter(id, event_name, MeterAggregation::new(AggregationType::Count));
    m.filters = filters
        .iter()
        .map(|(key, value)| MeterFilter {
            key: key.to_string(),
            values: vec![value.to_string()],
        })
        .collect();
    m
}

fn onboarding_config(actions: Vec<WorkflowAction>) -> WorkflowConfig {
    WorkflowConfig::new(actions.into_iter().map(WorkflowActionConfig::new).collect())
}

#[tokio::test]
async fn test_targeted_attribution_binds_event_to_line_item() {
    let harness = TestHarness::seeded().await;
    let event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");

    let records = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.sub_line_item_id, "li_api");
    assert_eq!(record.subscription_id, SUBSCRIPTION_ID);
    assert_eq!(record.price_id, "price_api");
    assert_eq!(record.meter_id, "meter_api");
    assert_eq!(record.feature_id, "feat_api");
    assert_eq!(record.event.customer_id, CUSTOMER_ID);
    assert_eq!(record.qty_total, Decimal::ONE);
    assert_eq!(record.sign, 1);
    assert_eq!(record.unique_hash.len(), 64);
}

#[tokio::test]
async fn test_strategies_produce_identical_usage() {
    let harness = TestHarness::seeded().await;
    let events = vec![
        event("evt_api", "api_call", "2024-03-10T12:00:00Z"),
        event_with(
            "evt_storage",
            "storage",
            "2024-03-11T08:30:00Z",
            json!({"gb": 5}),
        ),
        event_with(
            "evt_storage_str",
            "storage",
            "2024-03-12T08:30:00Z",
            json!({"gb": "2.5"}),
        ),
    ];

    for event in &events {
        let broad = attribute(&harness, TrackingStrategy::V1, event).await.unwrap();
        let targeted = attribute(&harness, TrackingStrategy::V2, event).await.unwrap();
        assert!(!targeted.is_empty(), "event {} was not attributed", event.id);
        assert_eq!(sorted(broad), sorted(targeted), "event {}", event.id);
    }
}

#[tokio::test]
async fn test_sum_meter_uses_property_value() {
    let harness = TestHarness::seeded().await;
    let event = event_with("evt_1", "storage", "2024-03-10T12:00:00Z", json!({"gb": 5}));

    let records = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].qty_total, dec("5"));
    assert_eq!(records[0].sub_line_item_id, "li_storage");
}

#[tokio::test]
async fn test_negative_quantity_is_clamped_to_zero() {
    let harness = TestHarness::seeded().await;
    let event = event_with("evt_1", "storage", "2024-03-10T12:00:00Z", json!({"gb": -3}));

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        let records = attribute(&harness, strategy, &event).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].qty_total, Decimal::ZERO);
    }
}

#[tokio::test]
async fn test_event_without_meter_is_skipped() {
    let harness = TestHarness::seeded().await;
    let event = event("evt_1", "page_view", "2024-03-10T12:00:00Z");

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        let records = attribute(&harness, strategy, &event).await.unwrap();
        assert!(records.is_empty());
    }
}

#[tokio::test]
async fn test_event_before_line_item_start_is_skipped() {
    let harness = TestHarness::seeded().await;
    let event = event("evt_1", "api_call", "2023-12-31T23:59:59Z");

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        let records = attribute(&harness, strategy, &event).await.unwrap();
        assert!(records.is_empty());
    }
}

#[tokio::test]
async fn test_line_item_end_date_is_exclusive() {
    let harness = TestHarness::seeded().await;
    let mut item = line_item("li_api", SUBSCRIPTION_ID, CUSTOMER_ID, "price_api", "meter_api");
    item.end_date = Some(at("2024-03-15T00:00:00Z"));
    harness.store.insert_line_item(item).await;

    let before = event("evt_before", "api_call", "2024-03-14T23:59:59Z");
    let at_end = event("evt_at_end", "api_call", "2024-03-15T00:00:00Z");

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        assert_eq!(attribute(&harness, strategy, &before).await.unwrap().len(), 1);
        assert!(attribute(&harness, strategy, &at_end).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_meter_filters_exclude_non_matching_events() {
    let harness = TestHarness::seeded().await;
    let mut filtered = meter(
        "meter_api",
        "api_call",
        MeterAggregation::new(AggregationType::Count),
    );
    filtered.filters = vec![MeterFilter {
        key: "region".to_string(),
        values: vec!["us-east-1".to_string()],
    }];
    harness.store.insert_meter(filtered).await;

    let matching = event_with(
        "evt_us",
        "api_call",
        "2024-03-10T12:00:00Z",
        json!({"region": "us-east-1"}),
    );
    let other = event_with(
        "evt_eu",
        "api_call",
        "2024-03-10T12:00:00Z",
        json!({"region": "eu-west-1"}),
    );

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        assert_eq!(attribute(&harness, strategy, &matching).await.unwrap().len(), 1);
        assert!(attribute(&harness, strategy, &other).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_unknown_customer_without_onboarding_is_skipped() {
    let harness = TestHarness::seeded().await;
    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "stranger".to_string();

    let records = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap();

    assert!(records.is_empty());
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_onboarding_requires_create_customer_first() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .set_onboarding_config(
            TENANT,
            ENV,
            onboarding_config(vec![
                WorkflowAction::CreateWallet,
                WorkflowAction::CreateCustomer,
            ]),
        )
        .await;
    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "newco".to_string();

    let records = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap();

    assert!(records.is_empty());
    assert!(harness.executor.calls().is_empty());
}

#[tokio::test]
async fn test_missing_customer_is_auto_provisioned() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .set_onboarding_config(
            TENANT,
            ENV,
            onboarding_config(vec![
                WorkflowAction::CreateCustomer,
                WorkflowAction::CreateSubscription,
            ]),
        )
        .await;

    // The subscription the workflow would create is already in place.
    let mut sub = subscription("sub_new", "cust_new");
    sub.line_items = vec![line_item(
        "li_new_api",
        "sub_new",
        "cust_new",
        "price_api",
        "meter_api",
    )];
    harness.store.insert_subscription(sub).await;
    harness
        .executor
        .set_script(OnboardingScript::CreateCustomer(customer("cust_new", "newco")));

    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "newco".to_string();

    let records = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event.customer_id, "cust_new");
    assert_eq!(records[0].sub_line_item_id, "li_new_api");

    let calls = harness.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, CUSTOMER_ONBOARDING_WORKFLOW);
    assert_eq!(calls[0].1["external_customer_id"], "newco");
    assert_eq!(calls[0].1["tenant_id"], TENANT);
}

#[tokio::test]
async fn test_failed_onboarding_is_retryable() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .set_onboarding_config(
            TENANT,
            ENV,
            onboarding_config(vec![WorkflowAction::CreateCustomer]),
        )
        .await;
    harness
        .executor
        .set_script(OnboardingScript::Fail("billing system offline".to_string()));

    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "newco".to_string();

    let err = attribute(&harness, TrackingStrategy::V2, &event)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::InternalError(_)));
    assert!(err.is_retryable());
    assert!(err.to_string().contains("billing system offline"));
}

#[tokio::test]
async fn test_unreachable_executor_is_retryable() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .set_onboarding_config(
            TENANT,
            ENV,
            onboarding_config(vec![WorkflowAction::CreateCustomer]),
        )
        .await;

    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "newco".to_string();

    let err = attribute(&harness, TrackingStrategy::V1, &event)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_cancelled_subscription_stops_billing_after_cancellation() {
    let harness = TestHarness::seeded().await;
    let mut sub = subscription(SUBSCRIPTION_ID, CUSTOMER_ID);
    sub.status = SubscriptionStatus::Cancelled;
    sub.cancelled_at = Some(at("2024-03-05T00:00:00Z"));
    harness.store.insert_subscription(sub).await;

    let event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        let records = attribute(&harness, strategy, &event).await.unwrap();
        assert!(records.is_empty());
    }
}

#[tokio::test]
async fn test_stalled_onboarding_times_out_as_retryable() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .set_onboarding_config(
            TENANT,
            ENV,
            onboarding_config(vec![WorkflowAction::CreateCustomer]),
        )
        .await;
    harness
        .executor
        .set_script(OnboardingScript::Stall(Duration::from_secs(2)));
    let context = AttributionContext::new(harness.repos())
        .with_workflow_executor(harness.executor.clone())
        .with_onboarding_timeout(Duration::from_millis(50));

    let mut event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    event.external_customer_id = "newco".to_string();

    for strategy in [TrackingStrategy::V1, TrackingStrategy::V2] {
        let started = Instant::now();
        let err = attributor_for(strategy, context.clone())
            .attribute(&event)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, AppError::InternalError(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}

#[tokio::test]
async fn test_strategies_agree_when_event_matches_several_meters() {
    let harness = TestHarness::seeded().await;
    seed_metered_item(
        &harness.store,
        "bytes",
        meter(
            "meter_bytes",
            "api_call",
            MeterAggregation::new(AggregationType::Sum).with_field("bytes"),
        ),
        "0.001",
    )
    .await;
    let event = event_with(
        "evt_1",
        "api_call",
        "2024-03-10T12:00:00Z",
        json!({"bytes": 2048}),
    );

    let records = assert_strategies_agree(&harness, &event).await;

    assert_eq!(line_item_ids(&records), vec!["li_api", "li_bytes"]);
    assert_eq!(records[0].qty_total, Decimal::ONE);
    assert_eq!(records[1].qty_total, dec("2048"));
}

#[tokio::test]
async fn test_strategies_agree_on_overlapping_filtered_meters() {
    let harness = TestHarness::seeded().await;
    seed_metered_item(
        &harness.store,
        "us",
        count_meter("meter_us", "api_call", &[("region", "us")]),
        "0.02",
    )
    .await;
    seed_metered_item(
        &harness.store,
        "us_gold",
        count_meter("meter_us_gold", "api_call", &[("region", "us"), ("tier", "gold")]),
        "0.05",
    )
    .await;

    let gold = event_with(
        "evt_gold",
        "api_call",
        "2024-03-10T12:00:00Z",
        json!({"region": "us", "tier": "gold"}),
    );
    let silver = event_with(
        "evt_silver",
        "api_call",
        "2024-03-10T12:00:00Z",
        json!({"region": "us", "tier": "silver"}),
    );

    let records = assert_strategies_agree(&harness, &gold).await;
    assert_eq!(line_item_ids(&records), vec!["li_api", "li_us", "li_us_gold"]);

    let records = assert_strategies_agree(&harness, &silver).await;
    assert_eq!(line_item_ids(&records), vec!["li_api", "li_us"]);
}

#[tokio::test]
async fn test_strategies_agree_across_subscriptions_and_prices() {
    let harness = TestHarness::seeded().await;
    harness
        .store
        .insert_price(price("price_api_overage", "meter_api", "0.02"))
        .await;
    harness
        .store
        .insert_line_item(line_item(
            "li_api_overage",
            SUBSCRIPTION_ID,
            CUSTOMER_ID,
            "price_api_overage",
            "meter_api",
        ))
        .await;

    let mut addon = subscription("sub_2", CUSTOMER_ID);
    addon.line_items = vec![line_item(
        "li_addon_api",
        "sub_2",
        CUSTOMER_ID,
        "price_api",
        "meter_api",
    )];
    harness.store.insert_subscription(addon).await;

    let event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    let records = assert_strategies_agree(&harness, &event).await;

    assert_eq!(
        line_item_ids(&records),
        vec!["li_addon_api", "li_api", "li_api_overage"]
    );
    let subscriptions: Vec<&str> = records.iter().map(|r| r.subscription_id.as_str()).collect();
    assert_eq!(subscriptions, vec!["sub_2", SUBSCRIPTION_ID, SUBSCRIPTION_ID]);
}

#[tokio::test]
async fn test_strategies_agree_on_retired_prices() {
    let harness = TestHarness::seeded().await;
    let mut retired = price("price_api", "meter_api", "0.01");
    retired.status = PriceStatus::Archived;
    retired.end_date = Some(at("2024-02-01T00:00:00Z"));
    harness.store.insert_price(retired).await;

    let event = event("evt_1", "api_call", "2024-03-10T12:00:00Z");
    let records = assert_strategies_agree(&harness, &event).await;

    assert_eq!(line_item_ids(&records), vec!["li_api"]);
    assert_eq!(records[0].price_id, "price_api");
}

#[tokio::test]
async fn test_strategies_agree_on_ended_and_cancelled_subscriptions() {
    let harness = TestHarness::seeded().await;
    let mut ended = subscription("sub_ended", CUSTOMER_ID);
    ended.end_date = Some(at("2024-03-05T00:00:00Z"));
    ended.line_items = vec![line_item(
        "li_ended_api",
        "sub_ended",
        CUSTOMER_ID,
        "price_api",
        "meter_api",
    )];
    harness.store.insert_subscription(ended).await;

    let mut cancelled = subscription("sub_cancelled", CUSTOMER_ID);
    cancelled.status = SubscriptionStatus::Cancelled;
    cancelled.cancelled_at = Some(at("2024-03-20T00:00:00Z"));
    cancelled.line_items = vec![line_item(
        "li_cancelled_api",
        "sub_cancelled",
        CUSTOMER_ID,
        "price_api",
        "meter_api",
    )];
    harness.store.insert_subscription(cancelled).await;

    let before_end = event("evt_early", "api_call", "2024-03-04T12:00:00Z");
    let records = assert_strategies_agree(&harness, &before_end).await;
    assert_eq!(line_item_ids(&records), vec!["li_api", "li_ended_api"]);

    let after_end = event("evt_late", "api_call", "2024-03-10T12:00:00Z");
    let records = assert_strategies_agree(&harness, &after_end).await;
    assert_eq!(line_item_ids(&records), vec!["li_api"]);
}
