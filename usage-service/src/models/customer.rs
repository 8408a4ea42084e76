//! Customer model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Customer resolved from an event's external id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub external_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Filter parameters for listing customers.
#[derive(Debug, Clone, Default)]
pub struct ListCustomersFilter {
    /// Empty means every customer of the environment.
    pub external_ids: Vec<String>,
}
