//! Usage analytics aggregates and query parameters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::{AggregationType, MeterAggregation, WindowSize};

/// Commitment outcome for one line item, or for one window of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitmentInfo {
    pub commitment_amount: Decimal,
    pub windowed: bool,
    pub overage_factor: Decimal,
    pub computed_commitment_utilized_amount: Decimal,
    pub computed_overage_amount: Decimal,
    pub computed_true_up_amount: Decimal,
}

/// One time-series point. Bucketed meters produce one point per bucket with
/// `window_start` set to the enclosing request window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAnalyticPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    pub usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub cost: Decimal,
    pub computed_commitment_utilized_amount: Decimal,
    pub computed_overage_amount: Decimal,
    pub computed_true_up_amount: Decimal,
}

/// Usage over a reporting window for one (feature, price, meter, line item)
/// combination, optionally split further by grouping dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedUsageAnalytic {
    pub feature_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub sub_line_item_id: String,
    pub subscription_id: String,
    pub feature_name: String,
    pub event_name: String,
    pub source: Option<String>,
    pub sources: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub aggregation_type: AggregationType,
    pub unit: Option<String>,
    pub unit_plural: Option<String>,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub addon_id: Option<String>,
    pub addon_name: Option<String>,
    pub total_usage: Decimal,
    pub max_usage: Decimal,
    pub latest_usage: Decimal,
    pub count_unique_usage: u64,
    pub event_count: u64,
    pub total_cost: Decimal,
    pub currency: String,
    pub commitment_info: Option<CommitmentInfo>,
    pub points: Vec<UsageAnalyticPoint>,
}

impl DetailedUsageAnalytic {
    pub fn new(
        feature_id: impl Into<String>,
        price_id: impl Into<String>,
        meter_id: impl Into<String>,
        sub_line_item_id: impl Into<String>,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            price_id: price_id.into(),
            meter_id: meter_id.into(),
            sub_line_item_id: sub_line_item_id.into(),
            subscription_id: String::new(),
            feature_name: String::new(),
            event_name: String::new(),
            source: None,
            sources: Vec::new(),
            properties: BTreeMap::new(),
            aggregation_type: AggregationType::Sum,
            unit: None,
            unit_plural: None,
            plan_id: None,
            plan_name: None,
            addon_id: None,
            addon_name: None,
            total_usage: Decimal::ZERO,
            max_usage: Decimal::ZERO,
            latest_usage: Decimal::ZERO,
            count_unique_usage: 0,
            event_count: 0,
            total_cost: Decimal::ZERO,
            currency: String::new(),
            commitment_info: None,
            points: Vec::new(),
        }
    }
}

/// Parameters for the store-side analytics query.
#[derive(Debug, Clone, Default)]
pub struct UsageAnalyticsParams {
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: String,
    pub external_customer_id: String,
    pub feature_ids: Vec<String>,
    pub sources: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub group_by: Vec<String>,
    pub window_size: Option<WindowSize>,
    pub property_filters: HashMap<String, Vec<String>>,
}

/// Bucket metadata pushed down to the analytics store for bucketed meters.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketFeatureInfo {
    pub feature_id: String,
    pub meter_id: String,
    pub event_name: String,
    pub bucket_size: WindowSize,
    pub aggregation: MeterAggregation,
}

/// Keyset-paginated reprocessing parameters.
#[derive(Debug, Clone)]
pub struct ReprocessEventsParams {
    pub tenant_id: String,
    pub environment_id: String,
    pub external_customer_id: Option<String>,
    pub event_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub batch_size: usize,
}

impl ReprocessEventsParams {
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub fn new(tenant_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
            external_customer_id: None,
            event_name: None,
            start_time: None,
            end_time: None,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }
}
