//! Stable identity hash for a usage fact.

use sha2::{Digest, Sha256};

use crate::models::{AggregationType, Event, Meter};
use crate::services::quantity::property_to_string;

/// SHA-256 hex digest identifying the usage fact for `(event, meter)`.
///
/// The input is `event_name:event_id`. Count-unique meters hash
/// `event_name:field:value` instead, so the same value seen again collapses
/// into one fact while distinct values stay distinct.
pub fn unique_hash(event: &Event, meter: &Meter) -> String {
    let mut input = format!("{}:{}", event.event_name, event.id);

    if meter.aggregation.aggregation_type == AggregationType::CountUnique {
        if let Some(field) = meter.aggregation.field_name() {
            if let Some(value) = event.properties.get(field) {
                input = format!(
                    "{}:{}:{}",
                    event.event_name,
                    field,
                    property_to_string(value)
                );
            }
        }
    }

    hex::encode(Sha256::digest(input.as_bytes()))
}
