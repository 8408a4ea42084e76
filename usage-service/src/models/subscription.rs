//! Subscription and subscription line item models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::PriceType;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Paused,
    Cancelled,
    Incomplete,
}

text_enum!(SubscriptionStatus {
    Active => "active",
    Trialing => "trialing",
    Paused => "paused",
    Cancelled => "cancelled",
    Incomplete => "incomplete",
});

/// Billing cadence unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Annual,
}

text_enum!(BillingPeriod {
    Daily => "DAILY",
    Weekly => "WEEKLY",
    Monthly => "MONTHLY",
    Quarterly => "QUARTERLY",
    HalfYearly => "HALF_YEARLY",
    Annual => "ANNUAL",
});

/// Subscription. `line_items` is populated only when requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub customer_id: String,
    pub plan_id: String,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub billing_anchor: DateTime<Utc>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub billing_period: BillingPeriod,
    pub billing_period_count: i32,
    #[serde(default)]
    #[sqlx(skip)]
    pub line_items: Vec<SubscriptionLineItem>,
}

impl Subscription {
    /// Whether an event at `ts` may be billed against this subscription:
    /// not before start, not after end, and not after cancellation.
    pub fn accepts_event_at(&self, ts: DateTime<Utc>) -> bool {
        if ts < self.start_date {
            return false;
        }
        if self.end_date.is_some_and(|end| ts > end) {
            return false;
        }
        if self.status == SubscriptionStatus::Cancelled
            && self.cancelled_at.is_some_and(|cancelled| ts > cancelled)
        {
            return false;
        }
        true
    }
}

/// Minimum-spend commitment carried by a line item.
///
/// `windowed` re-applies `amount` to every usage window instead of once per
/// billing period. Overage above the commitment is billed at
/// `overage_factor` times the raw rate; with `true_up_enabled` the shortfall
/// below the commitment is billed as a true-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub amount: Decimal,
    #[serde(default)]
    pub windowed: bool,
    #[serde(default = "default_overage_factor")]
    pub overage_factor: Decimal,
    #[serde(default)]
    pub true_up_enabled: bool,
}

fn default_overage_factor() -> Decimal {
    Decimal::ONE
}

impl Commitment {
    pub fn new(amount: Decimal) -> Self {
        Self {
            amount,
            windowed: false,
            overage_factor: Decimal::ONE,
            true_up_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineItemEntityType {
    Plan,
    Addon,
}

text_enum!(LineItemEntityType {
    Plan => "PLAN",
    Addon => "ADDON",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemStatus {
    Active,
    Archived,
}

text_enum!(LineItemStatus {
    Active => "active",
    Archived => "archived",
});

/// Binding of a subscription to one price (and through it, one meter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionLineItem {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub subscription_id: String,
    pub customer_id: String,
    #[sqlx(try_from = "String")]
    pub entity_type: LineItemEntityType,
    pub entity_id: String,
    pub price_id: String,
    #[sqlx(try_from = "String")]
    pub price_type: PriceType,
    pub meter_id: Option<String>,
    pub display_name: String,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: LineItemStatus,
    #[serde(default)]
    #[sqlx(json(nullable))]
    pub commitment: Option<Commitment>,
}

impl SubscriptionLineItem {
    pub fn is_usage(&self) -> bool {
        self.price_type == PriceType::Usage
    }

    /// Active window is `[start_date, end_date)`.
    pub fn is_active_at(&self, ts: DateTime<Utc>) -> bool {
        self.status == LineItemStatus::Active
            && ts >= self.start_date
            && self.end_date.map_or(true, |end| ts < end)
    }

    pub fn has_commitment(&self) -> bool {
        self.commitment
            .as_ref()
            .is_some_and(|c| c.amount > Decimal::ZERO)
    }
}

/// Filter parameters for listing subscriptions. Empty lists do not constrain.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub customer_ids: Vec<String>,
    pub subscription_ids: Vec<String>,
    pub statuses: Vec<SubscriptionStatus>,
    pub with_line_items: bool,
}

/// Filter parameters for listing subscription line items.
#[derive(Debug, Clone, Default)]
pub struct ListLineItemsFilter {
    pub customer_ids: Vec<String>,
    pub subscription_ids: Vec<String>,
    pub meter_ids: Vec<String>,
    /// Only items whose `[start_date, end_date)` window contains this instant.
    pub active_at: Option<DateTime<Utc>>,
}
