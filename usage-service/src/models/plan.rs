//! Plan and addon models. Only display metadata is read here.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub name: String,
}

/// Addon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Addon {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub name: String,
}
