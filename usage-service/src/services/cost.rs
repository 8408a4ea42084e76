//! Cost calculation for usage analytics, including bucketed meters and line
//! item commitments.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::warn;

use crate::models::{
    AggregationType, CommitmentInfo, DetailedUsageAnalytic, Meter, Price, SubscriptionLineItem,
    UsageAnalyticPoint,
};
use crate::services::commitment::apply_commitment;
use crate::services::pricing::{calculate_bucketed_cost, calculate_cost};

/// Usage figure that prices an item under `aggregation`.
pub fn usage_value(item: &DetailedUsageAnalytic, aggregation: AggregationType) -> Decimal {
    match aggregation {
        AggregationType::CountUnique => Decimal::from(item.count_unique_usage),
        AggregationType::Max => item.max_usage,
        AggregationType::Latest => item.latest_usage,
        _ => item.total_usage,
    }
}

/// Usage figure that prices a point under `aggregation`.
pub fn point_usage_value(point: &UsageAnalyticPoint, aggregation: AggregationType) -> Decimal {
    match aggregation {
        AggregationType::CountUnique => Decimal::from(point.count_unique_usage),
        AggregationType::Max => point.max_usage,
        AggregationType::Latest => point.latest_usage,
        _ => point.usage,
    }
}

/// Prices `item` in place: sets `total_cost`, `currency`, point costs and
/// commitment figures. Commitment failures degrade to the raw cost.
pub fn calculate_item_cost(
    item: &mut DetailedUsageAnalytic,
    meter: &Meter,
    price: &Price,
    line_item: Option<&SubscriptionLineItem>,
) {
    let line_item = line_item.filter(|li| li.has_commitment());

    if meter.is_bucketed_max_meter() {
        calculate_bucketed_cost_for_item(item, price, line_item, AggregationType::Max);
    } else if meter.is_bucketed_sum_meter() {
        calculate_bucketed_cost_for_item(item, price, line_item, AggregationType::Sum);
    } else {
        calculate_regular_cost(item, meter.aggregation.aggregation_type, price, line_item);
    }
    item.currency = price.currency.clone();
}

fn is_windowed(line_item: Option<&SubscriptionLineItem>) -> bool {
    line_item
        .and_then(|li| li.commitment.as_ref())
        .is_some_and(|c| c.windowed)
}

/// Each bucket is priced on its own. With a windowed commitment the
/// commitment applies per bucket and the total is the sum of bucket costs.
fn calculate_bucketed_cost_for_item(
    item: &mut DetailedUsageAnalytic,
    price: &Price,
    line_item: Option<&SubscriptionLineItem>,
    aggregation: AggregationType,
) {
    let windowed = is_windowed(line_item);

    if item.points.is_empty() {
        let total = usage_value(item, aggregation);
        let mut cost = Decimal::ZERO;
        if total > Decimal::ZERO {
            let buckets = [total];
            cost = calculate_bucketed_cost(price, &buckets);
            if let Some(li) = line_item {
                let default_cost = if aggregation == AggregationType::Max {
                    cost
                } else {
                    Decimal::ZERO
                };
                cost = apply_line_item_commitment(item, li, price, &buckets, default_cost);
            }
        }
        item.total_cost = cost;
        return;
    }

    let buckets: Vec<Decimal> = item
        .points
        .iter()
        .map(|p| point_usage_value(p, aggregation))
        .collect();

    let mut cost = match line_item {
        Some(_) if windowed => Decimal::ZERO,
        Some(li) => apply_line_item_commitment(item, li, price, &buckets, Decimal::ZERO),
        None => calculate_bucketed_cost(price, &buckets),
    };

    for (point, usage) in item.points.iter_mut().zip(buckets.iter().copied()) {
        match line_item.filter(|_| windowed) {
            Some(li) => price_point_with_commitment(point, li, price, usage),
            None => point.cost = calculate_cost(price, usage),
        }
    }

    item.points = merge_bucket_points_by_window(std::mem::take(&mut item.points), aggregation);

    if windowed {
        cost = item.points.iter().map(|p| p.cost).sum();
        item.commitment_info = line_item.map(|li| summarize_points(li, &item.points));
    }
    item.total_cost = cost;
}

fn calculate_regular_cost(
    item: &mut DetailedUsageAnalytic,
    aggregation: AggregationType,
    price: &Price,
    line_item: Option<&SubscriptionLineItem>,
) {
    item.total_usage = usage_value(item, aggregation);
    let mut cost = calculate_cost(price, item.total_usage);

    let windowed_line_item = line_item.filter(|_| is_windowed(line_item));
    let point_values: Vec<Decimal> = item
        .points
        .iter()
        .map(|p| point_usage_value(p, aggregation))
        .collect();

    if let Some(li) = line_item {
        cost = if windowed_line_item.is_some() && !point_values.is_empty() {
            apply_line_item_commitment(item, li, price, &point_values, Decimal::ZERO)
        } else {
            apply_line_item_commitment(item, li, price, &[], cost)
        };
    }
    item.total_cost = cost;

    for (point, usage) in item.points.iter_mut().zip(point_values) {
        match windowed_line_item {
            Some(li) => price_point_with_commitment(point, li, price, usage),
            None => point.cost = calculate_cost(price, usage),
        }
    }
}

/// Applies the line item's commitment and records the outcome on `item`.
/// Falls back to the raw (or bucketed) cost when the calculation fails.
fn apply_line_item_commitment(
    item: &mut DetailedUsageAnalytic,
    line_item: &SubscriptionLineItem,
    price: &Price,
    buckets: &[Decimal],
    default_cost: Decimal,
) -> Decimal {
    let raw_cost = if default_cost.is_zero() && !buckets.is_empty() {
        calculate_bucketed_cost(price, buckets)
    } else {
        default_cost
    };

    match apply_commitment(line_item, price, buckets, raw_cost) {
        Ok((cost, info)) => {
            item.commitment_info = info;
            cost
        }
        Err(e) => {
            warn!(
                line_item_id = %line_item.id,
                error = %e,
                "Failed to apply commitment, using raw cost"
            );
            raw_cost
        }
    }
}

fn price_point_with_commitment(
    point: &mut UsageAnalyticPoint,
    line_item: &SubscriptionLineItem,
    price: &Price,
    usage: Decimal,
) {
    match apply_commitment(line_item, price, &[usage], calculate_cost(price, usage)) {
        Ok((cost, info)) => {
            point.cost = cost;
            if let Some(info) = info {
                point.computed_commitment_utilized_amount =
                    info.computed_commitment_utilized_amount;
                point.computed_overage_amount = info.computed_overage_amount;
                point.computed_true_up_amount = info.computed_true_up_amount;
            }
        }
        Err(e) => {
            warn!(
                line_item_id = %line_item.id,
                timestamp = %point.timestamp,
                error = %e,
                "Failed to apply window commitment to point"
            );
            point.cost = calculate_cost(price, usage);
        }
    }
}

fn summarize_points(line_item: &SubscriptionLineItem, points: &[UsageAnalyticPoint]) -> CommitmentInfo {
    let commitment = line_item.commitment.as_ref();
    CommitmentInfo {
        commitment_amount: commitment.map(|c| c.amount).unwrap_or_default(),
        windowed: true,
        overage_factor: commitment.map(|c| c.overage_factor).unwrap_or(Decimal::ONE),
        computed_commitment_utilized_amount: points
            .iter()
            .map(|p| p.computed_commitment_utilized_amount)
            .sum(),
        computed_overage_amount: points.iter().map(|p| p.computed_overage_amount).sum(),
        computed_true_up_amount: points.iter().map(|p| p.computed_true_up_amount).sum(),
    }
}

/// Collapses bucket-level points into their request windows.
///
/// Points without a `window_start` are returned unchanged. Cost, event count
/// and commitment figures sum; usage is the maximum bucket for MAX meters and
/// the sum otherwise; latest usage comes from the chronologically last bucket.
pub fn merge_bucket_points_by_window(
    points: Vec<UsageAnalyticPoint>,
    aggregation: AggregationType,
) -> Vec<UsageAnalyticPoint> {
    if points.first().map_or(true, |p| p.window_start.is_none()) {
        return points;
    }

    let mut windows: BTreeMap<_, Vec<UsageAnalyticPoint>> = BTreeMap::new();
    for point in points {
        let key = point.window_start.unwrap_or(point.timestamp);
        windows.entry(key).or_default().push(point);
    }

    windows
        .into_iter()
        .map(|(window_start, buckets)| {
            let mut merged = UsageAnalyticPoint {
                timestamp: window_start,
                window_start: Some(window_start),
                ..Default::default()
            };
            for bucket in &buckets {
                merged.cost += bucket.cost;
                merged.event_count += bucket.event_count;
                merged.count_unique_usage += bucket.count_unique_usage;
                merged.computed_commitment_utilized_amount +=
                    bucket.computed_commitment_utilized_amount;
                merged.computed_overage_amount += bucket.computed_overage_amount;
                merged.computed_true_up_amount += bucket.computed_true_up_amount;
            }

            let usage = if aggregation == AggregationType::Max {
                buckets
                    .iter()
                    .map(|b| b.max_usage)
                    .fold(Decimal::ZERO, Decimal::max)
            } else {
                buckets.iter().map(|b| b.usage).sum()
            };
            merged.usage = usage;
            merged.max_usage = usage;
            merged.latest_usage = buckets
                .iter()
                .max_by_key(|b| b.timestamp)
                .map(|b| b.latest_usage)
                .unwrap_or_default();
            merged
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BillingModel, Commitment, LineItemEntityType, LineItemStatus, MeterAggregation,
        PriceEntityType, PriceStatus, PriceType, TierMode, WindowSize,
    };
    use chrono::{DateTime, Duration, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn price() -> Price {
        Price {
            id: "price_1".into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            amount: Decimal::ONE,
            currency: "usd".into(),
            price_type: PriceType::Usage,
            billing_model: BillingModel::FlatFee,
            tier_mode: TierMode::Volume,
            tiers: vec![],
            transform_quantity: None,
            meter_id: Some("meter_1".into()),
            entity_type: PriceEntityType::Plan,
            entity_id: "plan_1".into(),
            parent_price_id: None,
            status: PriceStatus::Published,
            end_date: None,
        }
    }

    fn meter(aggregation_type: AggregationType, bucket: Option<WindowSize>) -> Meter {
        let mut aggregation = MeterAggregation::new(aggregation_type).with_field("value");
        aggregation.bucket_size = bucket;
        Meter {
            id: "meter_1".into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            name: "Seats".into(),
            event_name: "seats".into(),
            aggregation,
            filters: vec![],
        }
    }

    fn line_item(commitment: Commitment) -> SubscriptionLineItem {
        SubscriptionLineItem {
            id: "li_1".into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            subscription_id: "sub_1".into(),
            customer_id: "cust_1".into(),
            entity_type: LineItemEntityType::Plan,
            entity_id: "plan_1".into(),
            price_id: "price_1".into(),
            price_type: PriceType::Usage,
            meter_id: Some("meter_1".into()),
            display_name: "Seats".into(),
            currency: "usd".into(),
            start_date: at("2024-01-01T00:00:00Z"),
            end_date: None,
            status: LineItemStatus::Active,
            commitment: Some(commitment),
        }
    }

    fn bucket(ts: DateTime<Utc>, window: DateTime<Utc>, value: &str) -> UsageAnalyticPoint {
        UsageAnalyticPoint {
            timestamp: ts,
            window_start: Some(window),
            usage: dec(value),
            max_usage: dec(value),
            latest_usage: dec(value),
            event_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn usage_value_follows_aggregation() {
        let mut item = DetailedUsageAnalytic::new("f", "p", "m", "li");
        item.total_usage = dec("10");
        item.max_usage = dec("7");
        item.latest_usage = dec("3");
        item.count_unique_usage = 4;
        assert_eq!(usage_value(&item, AggregationType::Sum), dec("10"));
        assert_eq!(usage_value(&item, AggregationType::Max), dec("7"));
        assert_eq!(usage_value(&item, AggregationType::Latest), dec("3"));
        assert_eq!(usage_value(&item, AggregationType::CountUnique), dec("4"));
    }

    #[test]
    fn merge_groups_buckets_by_window() {
        let day1 = at("2024-01-01T00:00:00Z");
        let day2 = at("2024-01-02T00:00:00Z");
        let points = vec![
            bucket(day2 + Duration::hours(1), day2, "4"),
            bucket(day1 + Duration::hours(1), day1, "2"),
            bucket(day1 + Duration::hours(5), day1, "9"),
        ];

        let merged = merge_bucket_points_by_window(points.clone(), AggregationType::Max);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].timestamp, day1);
        assert_eq!(merged[0].usage, dec("9"));
        assert_eq!(merged[0].latest_usage, dec("9"));
        assert_eq!(merged[0].event_count, 2);

        let summed = merge_bucket_points_by_window(points, AggregationType::Sum);
        assert_eq!(summed[0].usage, dec("11"));
        assert_eq!(summed[1].usage, dec("4"));
    }

    #[test]
    fn merge_leaves_unbucketed_points_alone() {
        let mut point = bucket(at("2024-01-01T00:00:00Z"), at("2024-01-01T00:00:00Z"), "1");
        point.window_start = None;
        let merged = merge_bucket_points_by_window(vec![point.clone()], AggregationType::Sum);
        assert_eq!(merged, vec![point]);
    }

    #[test]
    fn bucketed_max_prices_each_bucket() {
        let day = at("2024-01-01T00:00:00Z");
        let mut item = DetailedUsageAnalytic::new("f", "price_1", "meter_1", "");
        item.points = vec![
            bucket(day, day, "9"),
            bucket(day + Duration::hours(1), day, "10"),
        ];

        calculate_item_cost(
            &mut item,
            &meter(AggregationType::Max, Some(WindowSize::Hour)),
            &price(),
            None,
        );
        assert_eq!(item.total_cost, dec("19"));
        assert_eq!(item.points.len(), 1);
        assert_eq!(item.points[0].cost, dec("19"));
        assert_eq!(item.currency, "usd");
    }

    #[test]
    fn windowed_commitment_on_bucketed_sum_sums_window_costs() {
        let day = at("2024-01-01T00:00:00Z");
        let mut item = DetailedUsageAnalytic::new("f", "price_1", "meter_1", "li_1");
        item.points = (0..3)
            .map(|d| {
                let ts = day + Duration::days(d);
                bucket(ts, ts, "30")
            })
            .collect();

        let mut commitment = Commitment::new(dec("40"));
        commitment.windowed = true;
        commitment.true_up_enabled = true;
        let li = line_item(commitment);

        calculate_item_cost(
            &mut item,
            &meter(AggregationType::Sum, Some(WindowSize::Day)),
            &price(),
            Some(&li),
        );
        assert_eq!(item.total_cost, dec("120"));
        assert!(item.points.iter().all(|p| p.cost == dec("40")));
        let info = item.commitment_info.unwrap();
        assert_eq!(info.computed_true_up_amount, dec("30"));
    }

    #[test]
    fn regular_meter_with_period_commitment() {
        let mut item = DetailedUsageAnalytic::new("f", "price_1", "meter_1", "li_1");
        item.total_usage = dec("150");
        let li = line_item(Commitment::new(dec("100")));

        calculate_item_cost(&mut item, &meter(AggregationType::Sum, None), &price(), Some(&li));
        assert_eq!(item.total_cost, dec("150"));
        let info = item.commitment_info.unwrap();
        assert_eq!(info.computed_overage_amount, dec("50"));
        assert_eq!(info.computed_commitment_utilized_amount, dec("100"));
    }

    #[test]
    fn windowed_commitment_without_points_falls_back_to_raw_cost() {
        let mut item = DetailedUsageAnalytic::new("f", "price_1", "meter_1", "li_1");
        item.total_usage = dec("25");
        let mut commitment = Commitment::new(dec("40"));
        commitment.windowed = true;
        let li = line_item(commitment);

        calculate_item_cost(&mut item, &meter(AggregationType::Sum, None), &price(), Some(&li));
        assert_eq!(item.total_cost, dec("25"));
        assert!(item.commitment_info.is_none());
    }
}
