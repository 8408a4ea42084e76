//! In-memory implementation of every repository, used by tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{
    Addon, AggregationType, Customer, DetailedUsageAnalytic, Event, Feature, FeatureUsage,
    ListCustomersFilter, ListFeaturesFilter, ListLineItemsFilter, ListMetersFilter,
    ListPricesFilter, ListSubscriptionsFilter, Meter, Plan, Price, ReprocessEventsParams,
    Subscription, SubscriptionLineItem, UsageAnalyticPoint, UsageAnalyticsParams, WindowSize,
    WorkflowConfig,
};
use crate::services::quantity::property_to_string;
use crate::services::repository::{
    grouped_properties, groups_by_source, AddonRepository, BucketFeatures, CustomerRepository,
    EventRepository, FeatureRepository, FeatureUsageRepository, LineItemRepository,
    MeterRepository, PlanRepository, PriceRepository, SettingsRepository,
    SubscriptionRepository,
};

#[derive(Default)]
struct State {
    customers: BTreeMap<String, Customer>,
    subscriptions: BTreeMap<String, Subscription>,
    line_items: BTreeMap<String, SubscriptionLineItem>,
    prices: BTreeMap<String, Price>,
    meters: BTreeMap<String, Meter>,
    features: BTreeMap<String, Feature>,
    plans: BTreeMap<String, Plan>,
    addons: BTreeMap<String, Addon>,
    onboarding: HashMap<(String, String), WorkflowConfig>,
    events: BTreeMap<String, Event>,
    /// Insertion order is kept so reads are deterministic.
    feature_usage: Vec<FeatureUsage>,
    usage_keys: BTreeSet<(String, String, String, String)>,
}

/// Repository store backed by ordered maps behind one lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

fn scoped(tenant_id: &str, environment_id: &str, t: &str, e: &str) -> bool {
    tenant_id == t && environment_id == e
}

fn allowed(ids: &[String], id: &str) -> bool {
    ids.is_empty() || ids.iter().any(|i| i == id)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_customer(&self, customer: Customer) {
        self.state
            .write()
            .await
            .customers
            .insert(customer.id.clone(), customer);
    }

    /// Stores the subscription; its embedded line items are stored separately.
    pub async fn insert_subscription(&self, mut subscription: Subscription) {
        let mut state = self.state.write().await;
        for item in std::mem::take(&mut subscription.line_items) {
            state.line_items.insert(item.id.clone(), item);
        }
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn insert_line_item(&self, item: SubscriptionLineItem) {
        self.state
            .write()
            .await
            .line_items
            .insert(item.id.clone(), item);
    }

    pub async fn insert_price(&self, price: Price) {
        self.state
            .write()
            .await
            .prices
            .insert(price.id.clone(), price);
    }

    pub async fn insert_meter(&self, meter: Meter) {
        self.state
            .write()
            .await
            .meters
            .insert(meter.id.clone(), meter);
    }

    pub async fn insert_feature(&self, feature: Feature) {
        self.state
            .write()
            .await
            .features
            .insert(feature.id.clone(), feature);
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.write().await.plans.insert(plan.id.clone(), plan);
    }

    pub async fn insert_addon(&self, addon: Addon) {
        self.state
            .write()
            .await
            .addons
            .insert(addon.id.clone(), addon);
    }

    pub async fn set_onboarding_config(
        &self,
        tenant_id: &str,
        environment_id: &str,
        config: WorkflowConfig,
    ) {
        self.state
            .write()
            .await
            .onboarding
            .insert((tenant_id.to_string(), environment_id.to_string()), config);
    }

    pub async fn insert_event(&self, event: Event) {
        self.state
            .write()
            .await
            .events
            .insert(event.id.clone(), event);
    }

    /// Snapshot of stored feature usage in insertion order.
    pub async fn feature_usage(&self) -> Vec<FeatureUsage> {
        self.state.read().await.feature_usage.clone()
    }
}

#[async_trait]
impl CustomerRepository for InMemoryStore {
    async fn get_customer(
        &self,
        tenant_id: &str,
        environment_id: &str,
        customer_id: &str,
    ) -> Result<Customer, AppError> {
        let state = self.state.read().await;
        state
            .customers
            .get(customer_id)
            .filter(|c| scoped(tenant_id, environment_id, &c.tenant_id, &c.environment_id))
            .cloned()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id)))
    }

    async fn get_customer_by_external_id(
        &self,
        tenant_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> Result<Option<Customer>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .find(|c| {
                scoped(tenant_id, environment_id, &c.tenant_id, &c.environment_id)
                    && c.external_id == external_id
            })
            .cloned())
    }

    async fn list_customers(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListCustomersFilter,
    ) -> Result<Vec<Customer>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .filter(|c| scoped(tenant_id, environment_id, &c.tenant_id, &c.environment_id))
            .filter(|c| allowed(&filter.external_ids, &c.external_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.read().await;
        let subscriptions = state
            .subscriptions
            .values()
            .filter(|s| scoped(tenant_id, environment_id, &s.tenant_id, &s.environment_id))
            .filter(|s| allowed(&filter.customer_ids, &s.customer_id))
            .filter(|s| allowed(&filter.subscription_ids, &s.id))
            .filter(|s| filter.statuses.is_empty() || filter.statuses.contains(&s.status))
            .map(|s| {
                let mut sub = s.clone();
                if filter.with_line_items {
                    sub.line_items = state
                        .line_items
                        .values()
                        .filter(|li| li.subscription_id == sub.id)
                        .cloned()
                        .collect();
                }
                sub
            })
            .collect();
        Ok(subscriptions)
    }
}

#[async_trait]
impl LineItemRepository for InMemoryStore {
    async fn list_line_items(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListLineItemsFilter,
    ) -> Result<Vec<SubscriptionLineItem>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .line_items
            .values()
            .filter(|li| scoped(tenant_id, environment_id, &li.tenant_id, &li.environment_id))
            .filter(|li| allowed(&filter.customer_ids, &li.customer_id))
            .filter(|li| allowed(&filter.subscription_ids, &li.subscription_id))
            .filter(|li| {
                filter.meter_ids.is_empty()
                    || li
                        .meter_id
                        .as_deref()
                        .is_some_and(|m| filter.meter_ids.iter().any(|id| id == m))
            })
            .filter(|li| filter.active_at.map_or(true, |ts| li.is_active_at(ts)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PriceRepository for InMemoryStore {
    async fn list_prices(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListPricesFilter,
    ) -> Result<Vec<Price>, AppError> {
        let now = Utc::now();
        let state = self.state.read().await;
        Ok(state
            .prices
            .values()
            .filter(|p| scoped(tenant_id, environment_id, &p.tenant_id, &p.environment_id))
            .filter(|p| allowed(&filter.price_ids, &p.id))
            .filter(|p| {
                filter.meter_ids.is_empty()
                    || p.meter_id
                        .as_deref()
                        .is_some_and(|m| filter.meter_ids.iter().any(|id| id == m))
            })
            .filter(|p| filter.statuses.is_empty() || filter.statuses.contains(&p.status))
            .filter(|p| filter.allow_expired || !p.is_expired_at(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MeterRepository for InMemoryStore {
    async fn list_meters(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListMetersFilter,
    ) -> Result<Vec<Meter>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .meters
            .values()
            .filter(|m| scoped(tenant_id, environment_id, &m.tenant_id, &m.environment_id))
            .filter(|m| allowed(&filter.meter_ids, &m.id))
            .filter(|m| {
                filter
                    .event_name
                    .as_deref()
                    .map_or(true, |name| m.event_name == name)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeatureRepository for InMemoryStore {
    async fn list_features(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListFeaturesFilter,
    ) -> Result<Vec<Feature>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .features
            .values()
            .filter(|f| scoped(tenant_id, environment_id, &f.tenant_id, &f.environment_id))
            .filter(|f| allowed(&filter.feature_ids, &f.id))
            .filter(|f| {
                filter.meter_ids.is_empty()
                    || f.meter_id
                        .as_deref()
                        .is_some_and(|m| filter.meter_ids.iter().any(|id| id == m))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PlanRepository for InMemoryStore {
    async fn list_plans(
        &self,
        tenant_id: &str,
        environment_id: &str,
        plan_ids: &[String],
    ) -> Result<Vec<Plan>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .plans
            .values()
            .filter(|p| scoped(tenant_id, environment_id, &p.tenant_id, &p.environment_id))
            .filter(|p| allowed(plan_ids, &p.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AddonRepository for InMemoryStore {
    async fn list_addons(
        &self,
        tenant_id: &str,
        environment_id: &str,
        addon_ids: &[String],
    ) -> Result<Vec<Addon>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .addons
            .values()
            .filter(|a| scoped(tenant_id, environment_id, &a.tenant_id, &a.environment_id))
            .filter(|a| allowed(addon_ids, &a.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsRepository for InMemoryStore {
    async fn get_onboarding_config(
        &self,
        tenant_id: &str,
        environment_id: &str,
    ) -> Result<Option<WorkflowConfig>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .onboarding
            .get(&(tenant_id.to_string(), environment_id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn find_unprocessed(
        &self,
        params: &ReprocessEventsParams,
        last_id: Option<&str>,
        last_timestamp: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<Vec<Event>, AppError> {
        let state = self.state.read().await;
        let processed: BTreeSet<&str> = state
            .feature_usage
            .iter()
            .map(|u| u.event.id.as_str())
            .collect();

        let mut events: Vec<&Event> = state
            .events
            .values()
            .filter(|e| {
                scoped(
                    &params.tenant_id,
                    &params.environment_id,
                    &e.tenant_id,
                    &e.environment_id,
                )
            })
            .filter(|e| {
                params
                    .external_customer_id
                    .as_deref()
                    .map_or(true, |id| e.external_customer_id == id)
            })
            .filter(|e| {
                params
                    .event_name
                    .as_deref()
                    .map_or(true, |name| e.event_name == name)
            })
            .filter(|e| params.start_time.map_or(true, |start| e.timestamp >= start))
            .filter(|e| params.end_time.map_or(true, |end| e.timestamp <= end))
            .filter(|e| !processed.contains(e.id.as_str()))
            .filter(|e| match (last_timestamp, last_id) {
                (Some(ts), Some(id)) => (e.timestamp, e.id.as_str()) > (ts, id),
                _ => true,
            })
            .collect();

        events.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(events.into_iter().take(batch_size).cloned().collect())
    }
}

#[async_trait]
impl FeatureUsageRepository for InMemoryStore {
    async fn bulk_insert(&self, records: &[FeatureUsage]) -> Result<usize, AppError> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for record in records {
            if state.usage_keys.insert(record.dedup_key()) {
                state.feature_usage.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_detailed_usage_analytics(
        &self,
        params: &UsageAnalyticsParams,
        max_bucket_features: &BucketFeatures,
        sum_bucket_features: &BucketFeatures,
    ) -> Result<Vec<DetailedUsageAnalytic>, AppError> {
        let state = self.state.read().await;
        let properties = grouped_properties(&params.group_by);
        let by_source = groups_by_source(&params.group_by);

        let mut groups: BTreeMap<GroupKey, Vec<&FeatureUsage>> = BTreeMap::new();
        for usage in state.feature_usage.iter().filter(|u| matches_params(u, params)) {
            let key = GroupKey {
                feature_id: usage.feature_id.clone(),
                price_id: usage.price_id.clone(),
                meter_id: usage.meter_id.clone(),
                sub_line_item_id: usage.sub_line_item_id.clone(),
                source: by_source.then(|| usage.event.source.clone()),
                properties: properties
                    .iter()
                    .map(|name| {
                        let value = usage
                            .event
                            .properties
                            .get(name)
                            .map(property_to_string)
                            .unwrap_or_default();
                        (name.clone(), value)
                    })
                    .collect(),
            };
            groups.entry(key).or_default().push(usage);
        }

        let analytics = groups
            .into_iter()
            .map(|(key, rows)| {
                let bucket = max_bucket_features
                    .get(&key.feature_id)
                    .map(|info| (info.bucket_size, AggregationType::Max))
                    .or_else(|| {
                        sum_bucket_features
                            .get(&key.feature_id)
                            .map(|info| (info.bucket_size, AggregationType::Sum))
                    });
                build_analytic(key, &rows, bucket, params.window_size)
            })
            .collect();

        Ok(analytics)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    feature_id: String,
    price_id: String,
    meter_id: String,
    sub_line_item_id: String,
    source: Option<String>,
    properties: Vec<(String, String)>,
}

fn matches_params(usage: &FeatureUsage, params: &UsageAnalyticsParams) -> bool {
    let event = &usage.event;
    scoped(
        &params.tenant_id,
        &params.environment_id,
        &event.tenant_id,
        &event.environment_id,
    ) && (params.customer_id.is_empty() || event.customer_id == params.customer_id)
        && (params.external_customer_id.is_empty()
            || event.external_customer_id == params.external_customer_id)
        && allowed(&params.feature_ids, &usage.feature_id)
        && allowed(&params.sources, &event.source)
        && params.start_time.map_or(true, |start| event.timestamp >= start)
        && params.end_time.map_or(true, |end| event.timestamp < end)
        && params.property_filters.iter().all(|(key, values)| {
            values.is_empty()
                || event
                    .properties
                    .get(key)
                    .map(property_to_string)
                    .is_some_and(|v| values.contains(&v))
        })
}

/// Sum, max, latest, distinct-hash count and distinct-event count of rows.
struct Rollup {
    sum: Decimal,
    max: Decimal,
    latest: Decimal,
    count_unique: u64,
    event_count: u64,
}

fn rollup(rows: &[&FeatureUsage]) -> Rollup {
    let hashes: BTreeSet<&str> = rows.iter().map(|r| r.unique_hash.as_str()).collect();
    let events: BTreeSet<&str> = rows.iter().map(|r| r.event.id.as_str()).collect();
    Rollup {
        sum: rows.iter().map(|r| r.qty_total).sum(),
        max: rows
            .iter()
            .map(|r| r.qty_total)
            .fold(Decimal::ZERO, Decimal::max),
        latest: rows
            .iter()
            .max_by(|a, b| {
                (a.event.timestamp, &a.event.id).cmp(&(b.event.timestamp, &b.event.id))
            })
            .map(|r| r.qty_total)
            .unwrap_or_default(),
        count_unique: hashes.len() as u64,
        event_count: events.len() as u64,
    }
}

fn group_by_time<'a>(
    rows: &[&'a FeatureUsage],
    size: WindowSize,
) -> BTreeMap<DateTime<Utc>, Vec<&'a FeatureUsage>> {
    let mut grouped: BTreeMap<DateTime<Utc>, Vec<&FeatureUsage>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(size.truncate(row.event.timestamp))
            .or_default()
            .push(row);
    }
    grouped
}

fn build_analytic(
    key: GroupKey,
    rows: &[&FeatureUsage],
    bucket: Option<(WindowSize, AggregationType)>,
    window_size: Option<WindowSize>,
) -> DetailedUsageAnalytic {
    let mut item = DetailedUsageAnalytic::new(
        key.feature_id,
        key.price_id,
        key.meter_id,
        key.sub_line_item_id,
    );
    if let Some(first) = rows.first() {
        item.subscription_id = first.subscription_id.clone();
        item.event_name = first.event.event_name.clone();
    }
    item.source = key.source;
    item.properties = key.properties.into_iter().collect();
    item.sources = rows
        .iter()
        .map(|r| r.event.source.clone())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let totals = rollup(rows);
    item.total_usage = totals.sum;
    item.max_usage = totals.max;
    item.latest_usage = totals.latest;
    item.count_unique_usage = totals.count_unique;
    item.event_count = totals.event_count;

    match (bucket, window_size) {
        (Some((bucket_size, aggregation)), _) => {
            item.aggregation_type = aggregation;
            item.points = group_by_time(rows, bucket_size)
                .into_iter()
                .map(|(bucket_start, bucket_rows)| {
                    let stats = rollup(&bucket_rows);
                    let value = if aggregation == AggregationType::Max {
                        stats.max
                    } else {
                        stats.sum
                    };
                    UsageAnalyticPoint {
                        timestamp: bucket_start,
                        window_start: window_size.map(|w| w.truncate(bucket_start)),
                        usage: value,
                        max_usage: stats.max,
                        latest_usage: stats.latest,
                        count_unique_usage: stats.count_unique,
                        event_count: stats.event_count,
                        ..Default::default()
                    }
                })
                .collect();
            item.total_usage = item.points.iter().map(|p| p.usage).sum();
            item.max_usage = item
                .points
                .iter()
                .map(|p| p.usage)
                .fold(Decimal::ZERO, Decimal::max);
        }
        (None, Some(window)) => {
            item.points = group_by_time(rows, window)
                .into_iter()
                .map(|(window_start, window_rows)| {
                    let stats = rollup(&window_rows);
                    UsageAnalyticPoint {
                        timestamp: window_start,
                        window_start: None,
                        usage: stats.sum,
                        max_usage: stats.max,
                        latest_usage: stats.latest,
                        count_unique_usage: stats.count_unique,
                        event_count: stats.event_count,
                        ..Default::default()
                    }
                })
                .collect();
        }
        (None, None) => {}
    }

    item
}
