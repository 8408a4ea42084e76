//! Raw usage events and the feature usage facts derived from them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// An ingested usage event. Immutable apart from the resolved `customer_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub environment_id: String,
    pub event_name: String,
    pub external_customer_id: String,
    #[serde(default)]
    pub customer_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    #[sqlx(json)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// One billable usage fact per (event, matched meter/price) pair.
///
/// Idempotency at the storage boundary is scoped by [`FeatureUsage::dedup_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsage {
    #[serde(flatten)]
    pub event: Event,
    pub subscription_id: String,
    pub sub_line_item_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub feature_id: String,
    pub period_id: u64,
    pub unique_hash: String,
    pub qty_total: Decimal,
    pub sign: i32,
}

impl FeatureUsage {
    /// Insert-if-absent key: the fact hash scoped to its tenant, environment
    /// and line item, so distinct meters or customers never collapse.
    pub fn dedup_key(&self) -> (String, String, String, String) {
        (
            self.event.tenant_id.clone(),
            self.event.environment_id.clone(),
            self.sub_line_item_id.clone(),
            self.unique_hash.clone(),
        )
    }
}
