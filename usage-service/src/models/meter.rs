//! Meter model and aggregation descriptors.

use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// How a meter turns event properties into a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    CountUnique,
    Latest,
    SumWithMultiplier,
    Max,
    WeightedSum,
}

text_enum!(AggregationType {
    Count => "COUNT",
    Sum => "SUM",
    Avg => "AVG",
    CountUnique => "COUNT_UNIQUE",
    Latest => "LATEST",
    SumWithMultiplier => "SUM_WITH_MULTIPLIER",
    Max => "MAX",
    WeightedSum => "WEIGHTED_SUM",
});

/// Fixed time window used for meter buckets and analytics points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowSize {
    Minute,
    #[serde(rename = "15MIN")]
    FifteenMinute,
    #[serde(rename = "30MIN")]
    ThirtyMinute,
    Hour,
    #[serde(rename = "3HOUR")]
    ThreeHour,
    #[serde(rename = "6HOUR")]
    SixHour,
    #[serde(rename = "12HOUR")]
    TwelveHour,
    Day,
    Week,
    Month,
}

text_enum!(WindowSize {
    Minute => "MINUTE",
    FifteenMinute => "15MIN",
    ThirtyMinute => "30MIN",
    Hour => "HOUR",
    ThreeHour => "3HOUR",
    SixHour => "6HOUR",
    TwelveHour => "12HOUR",
    Day => "DAY",
    Week => "WEEK",
    Month => "MONTH",
});

impl WindowSize {
    fn fixed_duration(&self) -> Option<Duration> {
        match self {
            WindowSize::Minute => Some(Duration::minutes(1)),
            WindowSize::FifteenMinute => Some(Duration::minutes(15)),
            WindowSize::ThirtyMinute => Some(Duration::minutes(30)),
            WindowSize::Hour => Some(Duration::hours(1)),
            WindowSize::ThreeHour => Some(Duration::hours(3)),
            WindowSize::SixHour => Some(Duration::hours(6)),
            WindowSize::TwelveHour => Some(Duration::hours(12)),
            WindowSize::Day => Some(Duration::days(1)),
            WindowSize::Week | WindowSize::Month => None,
        }
    }

    /// Start of the window containing `ts`. Weeks start on Monday.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(step) = self.fixed_duration() {
            return ts.duration_trunc(step).unwrap_or(ts);
        }
        let day = ts.duration_trunc(Duration::days(1)).unwrap_or(ts);
        match self {
            WindowSize::Week => {
                day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
            }
            _ => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(day),
        }
    }
}

/// Aggregation descriptor carried by a meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterAggregation {
    #[serde(rename = "type")]
    pub aggregation_type: AggregationType,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub multiplier: Option<Decimal>,
    #[serde(default)]
    pub bucket_size: Option<WindowSize>,
}

impl MeterAggregation {
    pub fn new(aggregation_type: AggregationType) -> Self {
        Self {
            aggregation_type,
            field: None,
            multiplier: None,
            bucket_size: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Configured field name, treating an empty string as absent.
    pub fn field_name(&self) -> Option<&str> {
        self.field.as_deref().filter(|f| !f.is_empty())
    }
}

/// Property filter: the stringified property must be one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterFilter {
    pub key: String,
    pub values: Vec<String>,
}

/// Meter configuration. Read-only to this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Meter {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub name: String,
    pub event_name: String,
    #[sqlx(json)]
    pub aggregation: MeterAggregation,
    #[serde(default)]
    #[sqlx(json)]
    pub filters: Vec<MeterFilter>,
}

impl Meter {
    pub fn has_bucket_size(&self) -> bool {
        self.aggregation.bucket_size.is_some()
    }

    /// Peak-per-bucket meter, e.g. hourly maximum of concurrent seats.
    pub fn is_bucketed_max_meter(&self) -> bool {
        self.has_bucket_size() && self.aggregation.aggregation_type == AggregationType::Max
    }

    pub fn is_bucketed_sum_meter(&self) -> bool {
        self.has_bucket_size() && self.aggregation.aggregation_type == AggregationType::Sum
    }
}

/// Filter parameters for listing meters.
#[derive(Debug, Clone, Default)]
pub struct ListMetersFilter {
    pub meter_ids: Vec<String>,
    pub event_name: Option<String>,
}
