//! Request and response types for analytics, reprocessing and benchmarking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{DetailedUsageAnalytic, WindowSize};

/// Usage analytics query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetUsageAnalyticsRequest {
    pub tenant_id: String,
    pub environment_id: String,
    #[serde(default)]
    pub external_customer_id: String,
    /// Multi-customer variant; empty means every customer in the environment.
    #[serde(default)]
    pub external_customer_ids: Vec<String>,
    #[serde(default)]
    pub feature_ids: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub window_size: Option<WindowSize>,
    #[serde(default)]
    pub property_filters: HashMap<String, Vec<String>>,
}

/// Usage analytics result, sorted by feature name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUsageAnalyticsResponse {
    pub total_cost: Decimal,
    pub currency: String,
    pub items: Vec<DetailedUsageAnalytic>,
}

/// Request to reprocess a customer's historical events through a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReprocessEventsRequest {
    pub tenant_id: String,
    pub environment_id: String,
    pub external_customer_id: String,
    #[serde(default)]
    pub event_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Outcome of a direct reprocessing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessEventsSummary {
    pub total_events_found: usize,
    pub total_events_published: usize,
    pub pages: usize,
}

/// Handle of a started workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub run_id: String,
}

/// Timing of one attribution strategy for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub version: String,
    pub event_id: String,
    pub duration_ms: f64,
    pub feature_usage_count: usize,
    pub error: Option<String>,
}
