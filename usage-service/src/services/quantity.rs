//! Turns a raw event property into a billable quantity according to a
//! meter's aggregation rule.
//!
//! Extraction never fails: unusable input yields zero and a warning so that
//! one malformed event cannot abort a batch.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::warn;

use crate::models::{AggregationType, Event, Meter, Subscription};
use crate::services::period::{next_billing_date, period_start};

/// Extract `(quantity, raw string value)` for `event` under `meter`.
///
/// `period_id` is only consulted by weighted-sum meters, which prorate the
/// value over the remainder of the subscription's billing period.
pub fn extract_quantity(
    event: &Event,
    meter: &Meter,
    subscription: &Subscription,
    period_id: u64,
) -> (Decimal, String) {
    let aggregation = &meter.aggregation;
    let aggregation_type = aggregation.aggregation_type;

    if aggregation_type == AggregationType::Count {
        return (Decimal::ONE, String::new());
    }

    let Some(field) = aggregation.field_name() else {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            aggregation_type = %aggregation_type,
            "Aggregation configured without a field name"
        );
        return (Decimal::ZERO, String::new());
    };

    if aggregation_type == AggregationType::SumWithMultiplier && aggregation.multiplier.is_none() {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            "sum_with_multiplier aggregation without multiplier"
        );
        return (Decimal::ZERO, String::new());
    }

    let Some(value) = event.properties.get(field) else {
        warn!(
            event_id = %event.id,
            meter_id = %meter.id,
            field = %field,
            aggregation_type = %aggregation_type,
            "Property not found for aggregation"
        );
        return (Decimal::ZERO, String::new());
    };

    match aggregation_type {
        AggregationType::Count => (Decimal::ONE, String::new()),
        AggregationType::CountUnique => (Decimal::ONE, property_to_string(value)),
        AggregationType::Sum
        | AggregationType::Avg
        | AggregationType::Latest
        | AggregationType::Max => value_to_decimal(value, event, meter),
        AggregationType::SumWithMultiplier => {
            let (quantity, raw) = value_to_decimal(value, event, meter);
            match aggregation.multiplier {
                Some(multiplier) if !quantity.is_zero() => (quantity * multiplier, raw),
                _ => (Decimal::ZERO, raw),
            }
        }
        AggregationType::WeightedSum => {
            let (quantity, raw) = value_to_decimal(value, event, meter);
            if quantity.is_zero() {
                return (Decimal::ZERO, raw);
            }
            match weighted_quantity(event, subscription, quantity, period_id) {
                Some(weighted) => (weighted, raw),
                None => (Decimal::ZERO, raw),
            }
        }
    }
}

/// `value / period_seconds * remaining_seconds`, where the period starts at
/// `period_id` and ends at the subscription's next billing date.
fn weighted_quantity(
    event: &Event,
    subscription: &Subscription,
    value: Decimal,
    period_id: u64,
) -> Option<Decimal> {
    let start = period_start(period_id)?;
    let end = match next_billing_date(
        start,
        subscription.billing_anchor,
        subscription.billing_period_count,
        subscription.billing_period,
    ) {
        Ok(end) => end,
        Err(e) => {
            warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                period_id = period_id,
                error = %e,
                "Failed to calculate period end for weighted sum"
            );
            return None;
        }
    };

    let total_ms = (end - start).num_milliseconds();
    if total_ms <= 0 {
        warn!(
            event_id = %event.id,
            subscription_id = %subscription.id,
            period_id = period_id,
            "Billing period duration must be positive for weighted sum"
        );
        return None;
    }
    let remaining_ms = (end - event.timestamp).num_milliseconds().max(0);

    let total = Decimal::new(total_ms, 3);
    let remaining = Decimal::new(remaining_ms, 3);
    value.checked_div(total).map(|per_second| per_second * remaining)
}

/// Coerce a JSON property into a decimal. Unparseable values yield zero.
fn value_to_decimal(value: &Value, event: &Event, meter: &Meter) -> (Decimal, String) {
    let parsed = match value {
        Value::Number(n) => {
            let raw = n.to_string();
            let decimal = if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else if let Some(u) = n.as_u64() {
                Some(Decimal::from(u))
            } else {
                n.as_f64().and_then(Decimal::from_f64)
            };
            (decimal, raw)
        }
        Value::String(s) => (parse_decimal(s), s.clone()),
        other => (None, property_to_string(other)),
    };

    match parsed {
        (Some(decimal), raw) => (decimal, raw),
        (None, raw) => {
            warn!(
                event_id = %event.id,
                meter_id = %meter.id,
                value = %raw,
                "Failed to convert property value to decimal"
            );
            (Decimal::ZERO, raw)
        }
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let trimmed = s.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

/// String form of a property used for filter matching, count-unique values
/// and dedup hashing.
pub fn property_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
