//! Common test utilities for usage-service integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use usage_service::models::{
    AggregationType, BillingModel, BillingPeriod, Customer, Event, Feature, LineItemEntityType,
    LineItemStatus, Meter, MeterAggregation, Plan, Price, PriceEntityType, PriceStatus, PriceType,
    ReprocessEventsParams, Subscription, SubscriptionLineItem, SubscriptionStatus, TierMode,
    WorkflowRun,
};
use usage_service::services::attribution::AttributionContext;
use usage_service::services::repository::{EventRepository, Repositories};
use usage_service::services::{
    FeatureUsageTrackingService, InMemoryPubSub, InMemoryStore, TrackingSettings,
    TrackingStrategy, UsageAnalyticsService, WorkflowExecutor,
};

pub const TENANT: &str = "tenant_test";
pub const ENV: &str = "env_test";
pub const CUSTOMER_ID: &str = "cust_1";
pub const EXTERNAL_ID: &str = "acme";
pub const PLAN_ID: &str = "plan_pro";
pub const SUBSCRIPTION_ID: &str = "sub_1";

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,usage_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn at(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC 3339 timestamp")
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("valid decimal")
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn customer(id: &str, external_id: &str) -> Customer {
    Customer {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        external_id: external_id.to_string(),
        name: format!("Customer {}", external_id),
        created_at: at("2024-01-01T00:00:00Z"),
    }
}

pub fn meter(id: &str, event_name: &str, aggregation: MeterAggregation) -> Meter {
    Meter {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        name: id.to_string(),
        event_name: event_name.to_string(),
        aggregation,
        filters: Vec::new(),
    }
}

pub fn feature(id: &str, name: &str, meter_id: &str) -> Feature {
    Feature {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        name: name.to_string(),
        meter_id: Some(meter_id.to_string()),
        unit_singular: Some("unit".to_string()),
        unit_plural: Some("units".to_string()),
    }
}

/// Published flat-fee USD usage price owned by the fixture plan.
pub fn price(id: &str, meter_id: &str, amount: &str) -> Price {
    Price {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        amount: dec(amount),
        currency: "USD".to_string(),
        price_type: PriceType::Usage,
        billing_model: BillingModel::FlatFee,
        tier_mode: TierMode::Volume,
        tiers: Vec::new(),
        transform_quantity: None,
        meter_id: Some(meter_id.to_string()),
        entity_type: PriceEntityType::Plan,
        entity_id: PLAN_ID.to_string(),
        parent_price_id: None,
        status: PriceStatus::Published,
        end_date: None,
    }
}

/// Active monthly subscription anchored on the first of the month.
pub fn subscription(id: &str, customer_id: &str) -> Subscription {
    Subscription {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        customer_id: customer_id.to_string(),
        plan_id: PLAN_ID.to_string(),
        status: SubscriptionStatus::Active,
        currency: "USD".to_string(),
        start_date: at("2024-01-01T00:00:00Z"),
        end_date: None,
        cancelled_at: None,
        billing_anchor: at("2024-01-01T00:00:00Z"),
        current_period_start: at("2024-03-01T00:00:00Z"),
        current_period_end: at("2024-04-01T00:00:00Z"),
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        line_items: Vec::new(),
    }
}

pub fn line_item(
    id: &str,
    subscription_id: &str,
    customer_id: &str,
    price_id: &str,
    meter_id: &str,
) -> SubscriptionLineItem {
    SubscriptionLineItem {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        subscription_id: subscription_id.to_string(),
        customer_id: customer_id.to_string(),
        entity_type: LineItemEntityType::Plan,
        entity_id: PLAN_ID.to_string(),
        price_id: price_id.to_string(),
        price_type: PriceType::Usage,
        meter_id: Some(meter_id.to_string()),
        display_name: id.to_string(),
        currency: "USD".to_string(),
        start_date: at("2024-01-01T00:00:00Z"),
        end_date: None,
        status: LineItemStatus::Active,
        commitment: None,
    }
}

pub fn event(id: &str, event_name: &str, timestamp: &str) -> Event {
    Event {
        id: id.to_string(),
        tenant_id: TENANT.to_string(),
        environment_id: ENV.to_string(),
        event_name: event_name.to_string(),
        external_customer_id: EXTERNAL_ID.to_string(),
        customer_id: String::new(),
        timestamp: at(timestamp),
        source: "api".to_string(),
        properties: HashMap::new(),
    }
}

pub fn event_with(id: &str, event_name: &str, timestamp: &str, props: serde_json::Value) -> Event {
    let mut event = event(id, event_name, timestamp);
    if let serde_json::Value::Object(map) = props {
        event.properties = map.into_iter().collect();
    }
    event
}

/// Seeds one customer on the Pro plan with two usage line items:
///
/// - `api_call` events counted by `meter_api`, priced at 0.01 per call;
/// - `storage` events summing the `gb` property on `meter_storage`, priced at
///   2.00 per GB.
pub async fn seed_standard(store: &InMemoryStore) {
    store.insert_customer(customer(CUSTOMER_ID, EXTERNAL_ID)).await;
    store
        .insert_plan(Plan {
            id: PLAN_ID.to_string(),
            tenant_id: TENANT.to_string(),
            environment_id: ENV.to_string(),
            name: "Pro".to_string(),
        })
        .await;

    store
        .insert_meter(meter(
            "meter_api",
            "api_call",
            MeterAggregation::new(AggregationType::Count),
        ))
        .await;
    store
        .insert_meter(meter(
            "meter_storage",
            "storage",
            MeterAggregation::new(AggregationType::Sum).with_field("gb"),
        ))
        .await;

    store
        .insert_feature(feature("feat_api", "API Calls", "meter_api"))
        .await;
    store
        .insert_feature(feature("feat_storage", "Storage", "meter_storage"))
        .await;

    store.insert_price(price("price_api", "meter_api", "0.01")).await;
    store
        .insert_price(price("price_storage", "meter_storage", "2.00"))
        .await;

    let mut sub = subscription(SUBSCRIPTION_ID, CUSTOMER_ID);
    sub.line_items = vec![
        line_item("li_api", SUBSCRIPTION_ID, CUSTOMER_ID, "price_api", "meter_api"),
        line_item(
            "li_storage",
            SUBSCRIPTION_ID,
            CUSTOMER_ID,
            "price_storage",
            "meter_storage",
        ),
    ];
    store.insert_subscription(sub).await;
}

/// Binds `meter` to the standard subscription through its own feature, price
/// and line item. Ids are derived from `name`: `feat_<name>`, `price_<name>`
/// and `li_<name>`.
pub async fn seed_metered_item(store: &InMemoryStore, name: &str, meter: Meter, amount: &str) {
    let meter_id = meter.id.clone();
    let price_id = format!("price_{}", name);
    store.insert_meter(meter).await;
    store
        .insert_feature(feature(&format!("feat_{}", name), name, &meter_id))
        .await;
    store.insert_price(price(&price_id, &meter_id, amount)).await;
    store
        .insert_line_item(line_item(
            &format!("li_{}", name),
            SUBSCRIPTION_ID,
            CUSTOMER_ID,
            &price_id,
            &meter_id,
        ))
        .await;
}

// ============================================================================
// Workflow executor
// ============================================================================

/// What the scripted executor does when asked to onboard a customer.
#[derive(Debug, Clone)]
pub enum OnboardingScript {
    /// Stores the customer and reports a completed `create_customer` step.
    CreateCustomer(Customer),
    /// Reports a failed workflow with this summary.
    Fail(String),
    /// The executor itself cannot be reached.
    Unavailable,
    /// Hangs for this long before reporting a failed workflow.
    Stall(Duration),
}

/// Workflow executor that follows a script and records every call.
pub struct ScriptedWorkflowExecutor {
    store: Arc<InMemoryStore>,
    script: Mutex<OnboardingScript>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    runs: AtomicUsize,
}

impl ScriptedWorkflowExecutor {
    pub fn new(store: Arc<InMemoryStore>, script: OnboardingScript) -> Self {
        Self {
            store,
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn set_script(&self, script: OnboardingScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, name: &str, input: &serde_json::Value) {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), input.clone()));
    }
}

#[async_trait]
impl WorkflowExecutor for ScriptedWorkflowExecutor {
    async fn execute_workflow_sync(
        &self,
        name: &str,
        input: serde_json::Value,
        _timeout: Duration,
    ) -> Result<serde_json::Value, AppError> {
        self.record(name, &input);
        let script = self.script.lock().unwrap().clone();

        match script {
            OnboardingScript::CreateCustomer(customer) => {
                let customer_id = customer.id.clone();
                self.store.insert_customer(customer).await;
                Ok(json!({
                    "customer_id": customer_id,
                    "status": "completed",
                    "actions_executed": 1,
                    "results": [{
                        "action_type": "create_customer",
                        "action_index": 0,
                        "status": "completed",
                        "resource_id": customer_id
                    }]
                }))
            }
            OnboardingScript::Fail(summary) => Ok(json!({
                "status": "failed",
                "actions_executed": 1,
                "results": [],
                "error_summary": summary
            })),
            OnboardingScript::Unavailable => Err(AppError::ServiceUnavailable),
            OnboardingScript::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(json!({
                    "status": "failed",
                    "actions_executed": 0,
                    "results": [],
                    "error_summary": "stalled"
                }))
            }
        }
    }

    async fn execute_workflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowRun, AppError> {
        self.record(name, &input);
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(WorkflowRun {
            workflow_id: format!("wf-{}", n),
            run_id: format!("run-{}", n),
        })
    }
}

// ============================================================================
// Counting event repository
// ============================================================================

/// Event repository wrapper that records the size of every page it returns.
pub struct CountingEventRepository {
    inner: Arc<InMemoryStore>,
    pages: Mutex<Vec<usize>>,
}

impl CountingEventRepository {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn page_sizes(&self) -> Vec<usize> {
        self.pages.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventRepository for CountingEventRepository {
    async fn find_unprocessed(
        &self,
        params: &ReprocessEventsParams,
        last_id: Option<&str>,
        last_timestamp: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<Vec<Event>, AppError> {
        let events = self
            .inner
            .find_unprocessed(params, last_id, last_timestamp, batch_size)
            .await?;
        self.pages.lock().unwrap().push(events.len());
        Ok(events)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// In-memory wiring of the tracking and analytics services.
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub pubsub: Arc<InMemoryPubSub>,
    pub executor: Arc<ScriptedWorkflowExecutor>,
    pub events: Arc<CountingEventRepository>,
}

impl TestHarness {
    /// Empty store; no onboarding possible until a script is set.
    pub fn new() -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        Self {
            executor: Arc::new(ScriptedWorkflowExecutor::new(
                store.clone(),
                OnboardingScript::Unavailable,
            )),
            events: Arc::new(CountingEventRepository::new(store.clone())),
            pubsub: Arc::new(InMemoryPubSub::new()),
            store,
        }
    }

    pub async fn seeded() -> Self {
        let harness = Self::new();
        seed_standard(&harness.store).await;
        harness
    }

    pub fn repos(&self) -> Repositories {
        let mut repos = Repositories::from_store(self.store.clone());
        repos.events = self.events.clone() as Arc<dyn EventRepository>;
        repos
    }

    pub fn context(&self) -> AttributionContext {
        AttributionContext::new(self.repos())
            .with_workflow_executor(self.executor.clone())
            .with_onboarding_timeout(Duration::from_secs(5))
    }

    pub fn tracking(&self, strategy: TrackingStrategy) -> FeatureUsageTrackingService {
        self.tracking_with(TrackingSettings {
            strategy,
            retry_delay: Duration::from_millis(10),
            ..TrackingSettings::default()
        })
    }

    pub fn tracking_with(&self, settings: TrackingSettings) -> FeatureUsageTrackingService {
        FeatureUsageTrackingService::new(self.context(), self.pubsub.clone(), settings)
    }

    pub fn analytics(&self) -> UsageAnalyticsService {
        UsageAnalyticsService::new(self.repos())
    }
}
