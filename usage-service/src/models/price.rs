//! Price model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Usage prices are metered; fixed prices are billed per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceType {
    Usage,
    Fixed,
}

text_enum!(PriceType {
    Usage => "USAGE",
    Fixed => "FIXED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingModel {
    FlatFee,
    Package,
    Tiered,
}

text_enum!(BillingModel {
    FlatFee => "FLAT_FEE",
    Package => "PACKAGE",
    Tiered => "TIERED",
});

/// Volume prices the whole quantity at one tier; slab prices each slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierMode {
    Volume,
    Slab,
}

text_enum!(TierMode {
    Volume => "VOLUME",
    Slab => "SLAB",
});

/// Owner of a price. Subscription prices override a plan/addon parent price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceEntityType {
    Plan,
    Addon,
    Subscription,
}

text_enum!(PriceEntityType {
    Plan => "PLAN",
    Addon => "ADDON",
    Subscription => "SUBSCRIPTION",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceStatus {
    Published,
    Archived,
}

text_enum!(PriceStatus {
    Published => "published",
    Archived => "archived",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    Up,
    Down,
}

/// Package pricing: quantity is divided into packages before pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformQuantity {
    pub divide_by: u64,
    #[serde(default = "default_rounding")]
    pub round: RoundingMode,
}

fn default_rounding() -> RoundingMode {
    RoundingMode::Up
}

/// One tier. `up_to = None` is the open-ended last tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<u64>,
    pub unit_amount: Decimal,
    #[serde(default)]
    pub flat_amount: Option<Decimal>,
}

/// Billing rate linked to a meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Price {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub amount: Decimal,
    pub currency: String,
    #[sqlx(try_from = "String")]
    pub price_type: PriceType,
    #[sqlx(try_from = "String")]
    pub billing_model: BillingModel,
    #[sqlx(try_from = "String")]
    pub tier_mode: TierMode,
    #[serde(default)]
    #[sqlx(json)]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    #[sqlx(json(nullable))]
    pub transform_quantity: Option<TransformQuantity>,
    pub meter_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub entity_type: PriceEntityType,
    pub entity_id: String,
    pub parent_price_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: PriceStatus,
    pub end_date: Option<DateTime<Utc>>,
}

impl Price {
    pub fn is_usage(&self) -> bool {
        self.price_type == PriceType::Usage
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end <= at)
    }
}

/// Filter parameters for listing prices.
#[derive(Debug, Clone, Default)]
pub struct ListPricesFilter {
    pub price_ids: Vec<String>,
    pub meter_ids: Vec<String>,
    pub statuses: Vec<PriceStatus>,
    /// Include prices whose `end_date` has passed.
    pub allow_expired: bool,
}
