//! Event reprocessing tests for usage-service.

mod common;

use chrono::Duration;
use common::*;
use std::collections::HashSet;
use usage_service::models::{Event, ReprocessEventsParams};
use usage_service::services::TrackingStrategy;

/// Seeds `count` unprocessed `api_call` events, two per second so that
/// timestamp ties are broken by id.
async fn seed_events(harness: &TestHarness, count: usize) -> Vec<Event> {
    let base = at("2024-03-01T00:00:00Z");
    let mut events = Vec::with_capacity(count);
    for i in 0..count {
        let mut event = event(&format!("evt_{:04}", i), "api_call", "2024-03-01T00:00:00Z");
        event.timestamp = base + Duration::seconds((i / 2) as i64);
        harness.store.insert_event(event.clone()).await;
        events.push(event);
    }
    events
}

fn params() -> ReprocessEventsParams {
    ReprocessEventsParams::new(TENANT, ENV)
}

fn decode(harness: &TestHarness) -> Vec<Event> {
    harness
        .pubsub
        .published("events_backfill")
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect()
}

#[tokio::test]
async fn test_reprocess_pages_through_all_events_in_order() {
    let harness = TestHarness::seeded().await;
    seed_events(&harness, 250).await;
    let tracking = harness.tracking(TrackingStrategy::V2);

    let summary = tracking.reprocess_events(params()).await.unwrap();

    assert_eq!(summary.total_events_found, 250);
    assert_eq!(summary.total_events_published, 250);
    assert_eq!(summary.pages, 3);
    assert_eq!(harness.events.page_sizes(), vec![100, 100, 50]);

    let published = decode(&harness);
    assert_eq!(published.len(), 250);

    let ids: HashSet<&str> = published.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids.len(), 250, "an event was published twice");

    for pair in published.windows(2) {
        assert!(
            (pair[0].timestamp, &pair[0].id) < (pair[1].timestamp, &pair[1].id),
            "{} published before {}",
            pair[0].id,
            pair[1].id
        );
    }
}

#[tokio::test]
async fn test_reprocess_exact_multiple_ends_on_empty_page() {
    let harness = TestHarness::seeded().await;
    seed_events(&harness, 200).await;
    let tracking = harness.tracking(TrackingStrategy::V2);

    let summary = tracking.reprocess_events(params()).await.unwrap();

    assert_eq!(summary.total_events_found, 200);
    assert_eq!(summary.pages, 2);
    assert_eq!(harness.events.page_sizes(), vec![100, 100, 0]);
}

#[tokio::test]
async fn test_reprocess_skips_events_with_feature_usage() {
    let harness = TestHarness::seeded().await;
    let events = seed_events(&harness, 10).await;
    let tracking = harness.tracking(TrackingStrategy::V2);

    for event in &events[..4] {
        tracking.process_event(event).await.unwrap();
    }

    let summary = tracking.reprocess_events(params()).await.unwrap();

    assert_eq!(summary.total_events_found, 6);
    let published: Vec<String> = decode(&harness).into_iter().map(|e| e.id).collect();
    assert_eq!(
        published,
        vec!["evt_0004", "evt_0005", "evt_0006", "evt_0007", "evt_0008", "evt_0009"]
    );
}

#[tokio::test]
async fn test_reprocess_applies_filters_and_inclusive_end() {
    let harness = TestHarness::seeded().await;
    seed_events(&harness, 10).await;
    let mut storage = event("evt_storage", "storage", "2024-03-01T00:00:01Z");
    storage.properties.insert("gb".to_string(), serde_json::json!(1));
    harness.store.insert_event(storage).await;

    let tracking = harness.tracking(TrackingStrategy::V2);
    let mut params = params();
    params.event_name = Some("api_call".to_string());
    params.start_time = Some(at("2024-03-01T00:00:01Z"));
    params.end_time = Some(at("2024-03-01T00:00:03Z"));
    params.batch_size = 4;

    let summary = tracking.reprocess_events(params).await.unwrap();

    // Seconds 1, 2 and 3 hold two events each.
    assert_eq!(summary.total_events_found, 6);
    assert_eq!(summary.pages, 2);
    assert_eq!(harness.events.page_sizes(), vec![4, 2]);
    assert!(decode(&harness).iter().all(|e| e.event_name == "api_call"));
}

#[tokio::test]
async fn test_reprocess_zero_batch_uses_default() {
    let harness = TestHarness::seeded().await;
    seed_events(&harness, 120).await;
    let tracking = harness.tracking(TrackingStrategy::V2);
    let mut params = params();
    params.batch_size = 0;

    let summary = tracking.reprocess_events(params).await.unwrap();

    assert_eq!(summary.total_events_published, 120);
    assert_eq!(harness.events.page_sizes(), vec![100, 20]);
}

#[tokio::test]
async fn test_reprocess_with_no_events() {
    let harness = TestHarness::seeded().await;
    let tracking = harness.tracking(TrackingStrategy::V2);

    let summary = tracking.reprocess_events(params()).await.unwrap();

    assert_eq!(summary.total_events_found, 0);
    assert_eq!(summary.pages, 0);
    assert!(harness.pubsub.published("events_backfill").is_empty());
}

#[tokio::test]
async fn test_reprocessed_events_are_attributed_on_delivery() {
    let harness = TestHarness::seeded().await;
    seed_events(&harness, 3).await;
    let tracking = harness.tracking(TrackingStrategy::V2);

    tracking.reprocess_events(params()).await.unwrap();
    for message in harness.pubsub.published("events_backfill") {
        tracking.process_message(&message).await.unwrap();
    }

    assert_eq!(harness.store.feature_usage().await.len(), 3);
    let summary = tracking.reprocess_events(params()).await.unwrap();
    assert_eq!(summary.total_events_found, 0);
}
