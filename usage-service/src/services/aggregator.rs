//! Regrouping of detailed usage analytics by caller-chosen dimensions.

use std::collections::{BTreeMap, HashMap};

use crate::models::{DetailedUsageAnalytic, UsageAnalyticPoint};

pub const GROUP_BY_FEATURE_ID: &str = "feature_id";
pub const GROUP_BY_SOURCE: &str = "source";
pub const GROUP_BY_PROPERTY_PREFIX: &str = "properties.";

/// Merges items that share a grouping key.
///
/// The key always contains feature, price, meter and line item ids, so items
/// from different prices never merge. Grouping by nothing, or by feature id
/// alone, returns the input unchanged. Output keeps first-seen order.
pub fn aggregate_analytics_by_grouping(
    analytics: Vec<DetailedUsageAnalytic>,
    group_by: &[String],
) -> Vec<DetailedUsageAnalytic> {
    if group_by.is_empty() || (group_by.len() == 1 && group_by[0] == GROUP_BY_FEATURE_ID) {
        return analytics;
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut result: Vec<DetailedUsageAnalytic> = Vec::new();

    for item in analytics {
        let key = grouping_key(&item, group_by);
        match index.get(&key) {
            Some(&pos) => merge_into(&mut result[pos], item),
            None => {
                index.insert(key, result.len());
                result.push(item);
            }
        }
    }

    result
}

fn source_value(item: &DetailedUsageAnalytic) -> String {
    match &item.source {
        Some(source) => source.clone(),
        None => item.sources.join(","),
    }
}

pub fn grouping_key(item: &DetailedUsageAnalytic, group_by: &[String]) -> String {
    let mut parts = vec![
        item.feature_id.clone(),
        item.price_id.clone(),
        item.meter_id.clone(),
        item.sub_line_item_id.clone(),
    ];

    for group in group_by {
        if group == GROUP_BY_SOURCE {
            parts.push(source_value(item));
        } else if let Some(property) = group.strip_prefix(GROUP_BY_PROPERTY_PREFIX) {
            parts.push(item.properties.get(property).cloned().unwrap_or_default());
        }
    }

    parts.join("|")
}

fn merge_into(existing: &mut DetailedUsageAnalytic, item: DetailedUsageAnalytic) {
    existing.total_usage += item.total_usage;
    existing.max_usage = existing.max_usage.max(item.max_usage);
    existing.latest_usage = existing.latest_usage.max(item.latest_usage);
    existing.count_unique_usage += item.count_unique_usage;
    existing.event_count += item.event_count;
    existing.total_cost += item.total_cost;

    for source in item.sources {
        if !existing.sources.contains(&source) {
            existing.sources.push(source);
        }
    }
    existing.sources.sort();

    for (key, value) in item.properties {
        existing.properties.entry(key).or_insert(value);
    }

    let points = std::mem::take(&mut existing.points);
    existing.points = merge_time_series_points(points, item.points);
}

/// Merges two point series by exact timestamp, sorted ascending.
pub fn merge_time_series_points(
    existing: Vec<UsageAnalyticPoint>,
    incoming: Vec<UsageAnalyticPoint>,
) -> Vec<UsageAnalyticPoint> {
    let mut by_timestamp: BTreeMap<_, UsageAnalyticPoint> = BTreeMap::new();

    for point in existing.into_iter().chain(incoming) {
        match by_timestamp.get_mut(&point.timestamp) {
            Some(current) => {
                current.usage += point.usage;
                current.max_usage = current.max_usage.max(point.max_usage);
                current.latest_usage = current.latest_usage.max(point.latest_usage);
                current.count_unique_usage += point.count_unique_usage;
                current.event_count += point.event_count;
                current.cost += point.cost;
                current.computed_commitment_utilized_amount +=
                    point.computed_commitment_utilized_amount;
                current.computed_overage_amount += point.computed_overage_amount;
                current.computed_true_up_amount += point.computed_true_up_amount;
            }
            None => {
                by_timestamp.insert(point.timestamp, point);
            }
        }
    }

    by_timestamp.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal::Decimal;

    fn item(source: &str, usage: i64) -> DetailedUsageAnalytic {
        let mut item = DetailedUsageAnalytic::new("feat_1", "price_1", "meter_1", "li_1");
        item.source = Some(source.to_string());
        item.sources = vec![source.to_string()];
        item.total_usage = Decimal::from(usage);
        item.max_usage = Decimal::from(usage);
        item.event_count = 1;
        item
    }

    fn point(ts: &str, usage: i64) -> UsageAnalyticPoint {
        UsageAnalyticPoint {
            timestamp: ts.parse::<DateTime<Utc>>().unwrap(),
            usage: Decimal::from(usage),
            max_usage: Decimal::from(usage),
            event_count: 1,
            ..Default::default()
        }
    }

    fn groups(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_group_by_is_noop() {
        let input = vec![item("a", 1), item("a", 2)];
        let output = aggregate_analytics_by_grouping(input.clone(), &[]);
        assert_eq!(output, input);
    }

    #[test]
    fn feature_only_group_by_is_noop() {
        let input = vec![item("a", 1), item("a", 2)];
        let output = aggregate_analytics_by_grouping(input.clone(), &groups(&["feature_id"]));
        assert_eq!(output.len(), 2);
    }

    #[test]
    fn different_sources_never_merge() {
        let output = aggregate_analytics_by_grouping(
            vec![item("a", 1), item("b", 2)],
            &groups(&["source"]),
        );
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].sources, vec!["a".to_string()]);
        assert_eq!(output[1].sources, vec!["b".to_string()]);
    }

    #[test]
    fn same_key_merges_with_reducers() {
        let mut first = item("a", 3);
        first.points = vec![point("2024-01-01T00:00:00Z", 3)];
        first.total_cost = Decimal::from(30);
        let mut second = item("a", 5);
        second.points = vec![
            point("2024-01-01T00:00:00Z", 5),
            point("2024-01-02T00:00:00Z", 1),
        ];
        second.total_cost = Decimal::from(50);

        let output = aggregate_analytics_by_grouping(vec![first, second], &groups(&["source"]));
        assert_eq!(output.len(), 1);
        let merged = &output[0];
        assert_eq!(merged.total_usage, Decimal::from(8));
        assert_eq!(merged.max_usage, Decimal::from(5));
        assert_eq!(merged.event_count, 2);
        assert_eq!(merged.total_cost, Decimal::from(80));
        assert_eq!(merged.points.len(), 2);
        assert_eq!(merged.points[0].usage, Decimal::from(8));
        assert_eq!(merged.points[0].max_usage, Decimal::from(5));
    }

    #[test]
    fn property_dimension_splits_groups() {
        let mut east = item("a", 1);
        east.properties.insert("region".into(), "east".into());
        let mut west = item("a", 1);
        west.properties.insert("region".into(), "west".into());
        let mut east_again = item("a", 4);
        east_again.properties.insert("region".into(), "east".into());

        let output = aggregate_analytics_by_grouping(
            vec![east, west, east_again],
            &groups(&["properties.region"]),
        );
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].properties["region"], "east");
        assert_eq!(output[0].total_usage, Decimal::from(5));
    }

    #[test]
    fn different_line_items_never_merge() {
        let first = item("a", 1);
        let mut second = item("a", 1);
        second.sub_line_item_id = "li_2".into();
        let output = aggregate_analytics_by_grouping(vec![first, second], &groups(&["source"]));
        assert_eq!(output.len(), 2);
    }
}
