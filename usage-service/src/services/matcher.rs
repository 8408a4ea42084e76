//! Matches an event against candidate usage prices and their meters.

use std::collections::HashMap;
use tracing::warn;

use crate::models::{Event, Meter, MeterFilter, Price};
use crate::services::quantity::property_to_string;

/// A usage price whose meter accepts the event.
#[derive(Debug, Clone)]
pub struct PriceMatch<'a> {
    pub price: &'a Price,
    pub meter: &'a Meter,
}

/// Whether the event satisfies every filter. No filters always matches.
pub fn check_meter_filters(event: &Event, filters: &[MeterFilter]) -> bool {
    filters.iter().all(|filter| {
        event
            .properties
            .get(&filter.key)
            .map(property_to_string)
            .is_some_and(|value| filter.values.iter().any(|allowed| *allowed == value))
    })
}

/// Usage prices whose meter listens to the event's name and accepts its
/// properties, most specific meter first (more filters), ties broken by
/// ascending price id.
pub fn find_matching_prices<'a>(
    event: &Event,
    prices: &'a [Price],
    meters: &'a HashMap<String, Meter>,
) -> Vec<PriceMatch<'a>> {
    let mut matches: Vec<PriceMatch<'a>> = prices
        .iter()
        .filter(|price| price.is_usage())
        .filter_map(|price| {
            let meter = price.meter_id.as_ref().and_then(|id| meters.get(id));
            if meter.is_none() {
                warn!(
                    event_id = %event.id,
                    price_id = %price.id,
                    meter_id = ?price.meter_id,
                    "Meter not found for usage price"
                );
            }
            meter.map(|meter| PriceMatch { price, meter })
        })
        .filter(|m| m.meter.event_name == event.event_name)
        .filter(|m| check_meter_filters(event, &m.meter.filters))
        .collect();

    matches.sort_by(|a, b| {
        b.meter
            .filters
            .len()
            .cmp(&a.meter.filters.len())
            .then_with(|| a.price.id.cmp(&b.price.id))
    });
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AggregationType, BillingModel, MeterAggregation, PriceEntityType, PriceStatus, PriceType,
        TierMode,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn event() -> Event {
        let mut properties = HashMap::new();
        properties.insert("region".to_string(), json!("us-east"));
        properties.insert("tier".to_string(), json!(2));
        Event {
            id: "evt_1".into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            event_name: "api_call".into(),
            external_customer_id: "cust_ext".into(),
            customer_id: String::new(),
            timestamp: Utc::now(),
            source: String::new(),
            properties,
        }
    }

    fn filter(key: &str, values: &[&str]) -> MeterFilter {
        MeterFilter {
            key: key.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn meter(id: &str, event_name: &str, filters: Vec<MeterFilter>) -> Meter {
        Meter {
            id: id.into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            name: id.into(),
            event_name: event_name.into(),
            aggregation: MeterAggregation::new(AggregationType::Count),
            filters,
        }
    }

    fn price(id: &str, meter_id: &str, price_type: PriceType) -> Price {
        Price {
            id: id.into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            amount: Decimal::ONE,
            currency: "usd".into(),
            price_type,
            billing_model: BillingModel::FlatFee,
            tier_mode: TierMode::Volume,
            tiers: vec![],
            transform_quantity: None,
            meter_id: Some(meter_id.into()),
            entity_type: PriceEntityType::Plan,
            entity_id: "plan_1".into(),
            parent_price_id: None,
            status: PriceStatus::Published,
            end_date: None,
        }
    }

    fn meter_map(meters: Vec<Meter>) -> HashMap<String, Meter> {
        meters.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    #[test]
    fn empty_filters_always_match() {
        assert!(check_meter_filters(&event(), &[]));
    }

    #[test]
    fn filters_compare_stringified_values() {
        assert!(check_meter_filters(&event(), &[filter("tier", &["1", "2"])]));
        assert!(!check_meter_filters(&event(), &[filter("tier", &["3"])]));
        assert!(!check_meter_filters(&event(), &[filter("missing", &["x"])]));
    }

    #[test]
    fn more_specific_meter_wins() {
        let meters = meter_map(vec![
            meter("m_broad", "api_call", vec![filter("region", &["us-east"])]),
            meter(
                "m_narrow",
                "api_call",
                vec![filter("region", &["us-east"]), filter("tier", &["2"])],
            ),
        ]);
        let prices = vec![
            price("price_a", "m_broad", PriceType::Usage),
            price("price_b", "m_narrow", PriceType::Usage),
        ];

        let matches = find_matching_prices(&event(), &prices, &meters);
        let ids: Vec<&str> = matches.iter().map(|m| m.price.id.as_str()).collect();
        assert_eq!(ids, vec!["price_b", "price_a"]);
    }

    #[test]
    fn ties_break_on_price_id() {
        let meters = meter_map(vec![
            meter("m1", "api_call", vec![]),
            meter("m2", "api_call", vec![]),
        ]);
        let prices = vec![
            price("price_z", "m1", PriceType::Usage),
            price("price_c", "m2", PriceType::Usage),
        ];

        let matches = find_matching_prices(&event(), &prices, &meters);
        let ids: Vec<&str> = matches.iter().map(|m| m.price.id.as_str()).collect();
        assert_eq!(ids, vec!["price_c", "price_z"]);
    }

    #[test]
    fn skips_fixed_prices_other_events_and_failed_filters() {
        let meters = meter_map(vec![
            meter("m_other", "page_view", vec![]),
            meter("m_eu", "api_call", vec![filter("region", &["eu-west"])]),
            meter("m_ok", "api_call", vec![]),
        ]);
        let prices = vec![
            price("price_fixed", "m_ok", PriceType::Fixed),
            price("price_other", "m_other", PriceType::Usage),
            price("price_eu", "m_eu", PriceType::Usage),
            price("price_orphan", "m_missing", PriceType::Usage),
        ];

        assert!(find_matching_prices(&event(), &prices, &meters).is_empty());
    }
}
