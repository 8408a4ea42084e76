//! Feature model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Billable capability, backed by exactly one meter when metered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Feature {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub name: String,
    pub meter_id: Option<String>,
    pub unit_singular: Option<String>,
    pub unit_plural: Option<String>,
}

/// Filter parameters for listing features.
#[derive(Debug, Clone, Default)]
pub struct ListFeaturesFilter {
    pub feature_ids: Vec<String>,
    pub meter_ids: Vec<String>,
}
