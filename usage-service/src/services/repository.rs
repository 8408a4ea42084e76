//! Narrow storage interfaces consumed by the tracking pipeline.
//!
//! Every list operation is scoped to one tenant and environment. Empty id
//! lists in a filter do not constrain the result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{
    Addon, BucketFeatureInfo, Customer, DetailedUsageAnalytic, Event, Feature, FeatureUsage,
    ListCustomersFilter, ListFeaturesFilter, ListLineItemsFilter, ListMetersFilter,
    ListPricesFilter, ListSubscriptionsFilter, Meter, Plan, Price, ReprocessEventsParams,
    Subscription, SubscriptionLineItem, UsageAnalyticsParams, WorkflowConfig,
};

/// Bucketed features keyed by feature id.
pub type BucketFeatures = HashMap<String, BucketFeatureInfo>;

#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn get_customer(
        &self,
        tenant_id: &str,
        environment_id: &str,
        customer_id: &str,
    ) -> Result<Customer, AppError>;

    /// `Ok(None)` when no customer carries the external id.
    async fn get_customer_by_external_id(
        &self,
        tenant_id: &str,
        environment_id: &str,
        external_id: &str,
    ) -> Result<Option<Customer>, AppError>;

    async fn list_customers(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListCustomersFilter,
    ) -> Result<Vec<Customer>, AppError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn list_subscriptions(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError>;
}

#[async_trait]
pub trait LineItemRepository: Send + Sync {
    async fn list_line_items(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListLineItemsFilter,
    ) -> Result<Vec<SubscriptionLineItem>, AppError>;
}

#[async_trait]
pub trait PriceRepository: Send + Sync {
    async fn list_prices(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListPricesFilter,
    ) -> Result<Vec<Price>, AppError>;
}

#[async_trait]
pub trait MeterRepository: Send + Sync {
    async fn list_meters(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListMetersFilter,
    ) -> Result<Vec<Meter>, AppError>;
}

#[async_trait]
pub trait FeatureRepository: Send + Sync {
    async fn list_features(
        &self,
        tenant_id: &str,
        environment_id: &str,
        filter: &ListFeaturesFilter,
    ) -> Result<Vec<Feature>, AppError>;
}

#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn list_plans(
        &self,
        tenant_id: &str,
        environment_id: &str,
        plan_ids: &[String],
    ) -> Result<Vec<Plan>, AppError>;
}

#[async_trait]
pub trait AddonRepository: Send + Sync {
    async fn list_addons(
        &self,
        tenant_id: &str,
        environment_id: &str,
        addon_ids: &[String],
    ) -> Result<Vec<Addon>, AppError>;
}

/// Per-environment settings.
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Customer onboarding workflow setting, if the environment has one.
    async fn get_onboarding_config(
        &self,
        tenant_id: &str,
        environment_id: &str,
    ) -> Result<Option<WorkflowConfig>, AppError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// One keyset page of events that have no feature usage yet, ordered by
    /// `(timestamp, id)` ascending and strictly after the cursor when given.
    async fn find_unprocessed(
        &self,
        params: &ReprocessEventsParams,
        last_id: Option<&str>,
        last_timestamp: Option<DateTime<Utc>>,
        batch_size: usize,
    ) -> Result<Vec<Event>, AppError>;
}

#[async_trait]
pub trait FeatureUsageRepository: Send + Sync {
    /// Insert-if-absent keyed by [`FeatureUsage::dedup_key`]. Returns the rows inserted.
    async fn bulk_insert(&self, records: &[FeatureUsage]) -> Result<usize, AppError>;

    /// Per-(feature, price, meter, line item) usage with the grouping
    /// dimensions in `params.group_by`. Bucketed features get one point per
    /// bucket, tagged with the enclosing request window.
    async fn get_detailed_usage_analytics(
        &self,
        params: &UsageAnalyticsParams,
        max_bucket_features: &BucketFeatures,
        sum_bucket_features: &BucketFeatures,
    ) -> Result<Vec<DetailedUsageAnalytic>, AppError>;
}

/// The set of repositories the pipeline reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub customers: Arc<dyn CustomerRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub line_items: Arc<dyn LineItemRepository>,
    pub prices: Arc<dyn PriceRepository>,
    pub meters: Arc<dyn MeterRepository>,
    pub features: Arc<dyn FeatureRepository>,
    pub plans: Arc<dyn PlanRepository>,
    pub addons: Arc<dyn AddonRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub events: Arc<dyn EventRepository>,
    pub feature_usage: Arc<dyn FeatureUsageRepository>,
}

impl Repositories {
    /// Uses one store for every repository.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: CustomerRepository
            + SubscriptionRepository
            + LineItemRepository
            + PriceRepository
            + MeterRepository
            + FeatureRepository
            + PlanRepository
            + AddonRepository
            + SettingsRepository
            + EventRepository
            + FeatureUsageRepository
            + 'static,
    {
        Self {
            customers: store.clone(),
            subscriptions: store.clone(),
            line_items: store.clone(),
            prices: store.clone(),
            meters: store.clone(),
            features: store.clone(),
            plans: store.clone(),
            addons: store.clone(),
            settings: store.clone(),
            events: store.clone(),
            feature_usage: store,
        }
    }
}

/// Property names requested as `properties.<name>` grouping dimensions.
pub fn grouped_properties(group_by: &[String]) -> Vec<String> {
    group_by
        .iter()
        .filter_map(|g| g.strip_prefix(super::aggregator::GROUP_BY_PROPERTY_PREFIX))
        .map(str::to_string)
        .collect()
}

pub fn groups_by_source(group_by: &[String]) -> bool {
    group_by
        .iter()
        .any(|g| g == super::aggregator::GROUP_BY_SOURCE)
}
