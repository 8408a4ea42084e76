use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, instrument, warn};

use super::{
    build_feature_usage, subscription_period_id, AttributionContext, TrackingStrategy,
    UsageAttributor, UsageTarget,
};
use crate::models::{
    Event, FeatureUsage, ListFeaturesFilter, ListMetersFilter, ListPricesFilter,
    ListSubscriptionsFilter, Meter, Price, SubscriptionLineItem, SubscriptionStatus,
};
use crate::services::matcher::find_matching_prices;

/// Subscription-first attribution (V1).
pub struct BroadScanAttributor {
    context: AttributionContext,
}

impl BroadScanAttributor {
    pub fn new(context: AttributionContext) -> Self {
        Self { context }
    }
}

fn billable_now<'a>(
    items: &'a [SubscriptionLineItem],
    event: &'a Event,
) -> impl Iterator<Item = &'a SubscriptionLineItem> {
    items
        .iter()
        .filter(move |li| li.is_usage() && li.is_active_at(event.timestamp))
}

#[async_trait]
impl UsageAttributor for BroadScanAttributor {
    fn strategy(&self) -> TrackingStrategy {
        TrackingStrategy::V1
    }

    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.id,
            event_name = %event.event_name,
            tenant_id = %event.tenant_id,
            strategy = "v1"
        )
    )]
    async fn attribute(&self, event: &Event) -> Result<Vec<FeatureUsage>, AppError> {
        let repos = &self.context.repos;
        let (tenant_id, environment_id) = (event.tenant_id.as_str(), event.environment_id.as_str());

        let Some(customer) = self.context.resolve_customer(event).await? else {
            return Ok(Vec::new());
        };

        let subscriptions = repos
            .subscriptions
            .list_subscriptions(
                tenant_id,
                environment_id,
                &ListSubscriptionsFilter {
                    customer_ids: vec![customer.id.clone()],
                    statuses: vec![SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                    with_line_items: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                error!(customer_id = %customer.id, error = %e, "Failed to get subscriptions");
                e
            })?;

        if subscriptions.is_empty() {
            debug!(customer_id = %customer.id, "No active subscriptions found for customer, skipping");
            return Ok(Vec::new());
        }

        let subscriptions: Vec<_> = subscriptions
            .into_iter()
            .filter(|s| s.accepts_event_at(event.timestamp))
            .collect();
        if subscriptions.is_empty() {
            debug!(
                customer_id = %customer.id,
                event_timestamp = %event.timestamp,
                "No subscriptions valid for event timestamp, skipping"
            );
            return Ok(Vec::new());
        }

        let price_ids: Vec<String> = subscriptions
            .iter()
            .flat_map(|s| billable_now(&s.line_items, event))
            .map(|li| li.price_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if price_ids.is_empty() {
            debug!(customer_id = %customer.id, "No active usage line items, skipping");
            return Ok(Vec::new());
        }

        // Line items are the binding; archived or expired prices still bill.
        let prices = repos
            .prices
            .list_prices(
                tenant_id,
                environment_id,
                &ListPricesFilter {
                    price_ids,
                    allow_expired: true,
                    ..Default::default()
                },
            )
            .await?;
        let price_map: HashMap<String, Price> = prices
            .into_iter()
            .filter(Price::is_usage)
            .map(|p| (p.id.clone(), p))
            .collect();

        let meter_ids: Vec<String> = price_map
            .values()
            .filter_map(|p| p.meter_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let meters = repos
            .meters
            .list_meters(
                tenant_id,
                environment_id,
                &ListMetersFilter {
                    meter_ids: meter_ids.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let meter_map: HashMap<String, Meter> =
            meters.into_iter().map(|m| (m.id.clone(), m)).collect();

        let mut feature_by_meter: HashMap<String, String> = HashMap::new();
        if !meter_map.is_empty() {
            let features = repos
                .features
                .list_features(
                    tenant_id,
                    environment_id,
                    &ListFeaturesFilter {
                        meter_ids,
                        ..Default::default()
                    },
                )
                .await?;
            for feature in features {
                if let Some(meter_id) = feature.meter_id {
                    feature_by_meter.insert(meter_id, feature.id);
                }
            }
        }

        let mut records = Vec::new();
        for subscription in &subscriptions {
            let period_id = match subscription_period_id(event, subscription) {
                Ok(id) => id,
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Failed to calculate period id");
                    continue;
                }
            };

            let line_items: Vec<&SubscriptionLineItem> =
                billable_now(&subscription.line_items, event).collect();
            if line_items.is_empty() {
                debug!(subscription_id = %subscription.id, "No active usage-based line items found for subscription");
                continue;
            }

            let mut line_item_by_price: HashMap<&str, &SubscriptionLineItem> = HashMap::new();
            let mut candidate_prices: Vec<Price> = Vec::with_capacity(line_items.len());
            for item in line_items {
                match price_map.get(&item.price_id) {
                    Some(price) => {
                        line_item_by_price.insert(item.price_id.as_str(), item);
                        candidate_prices.push(price.clone());
                    }
                    None => warn!(
                        subscription_id = %subscription.id,
                        line_item_id = %item.id,
                        price_id = %item.price_id,
                        "Price not found for subscription line item"
                    ),
                }
            }

            let matches = find_matching_prices(event, &candidate_prices, &meter_map);
            if matches.is_empty() {
                debug!(subscription_id = %subscription.id, "No matching prices/meters found for subscription");
                continue;
            }

            for matched in matches {
                let Some(line_item) = line_item_by_price.get(matched.price.id.as_str()).copied() else {
                    warn!(price_id = %matched.price.id, "Line item not found for price");
                    continue;
                };
                let Some(feature_id) = feature_by_meter.get(&matched.meter.id) else {
                    warn!(meter_id = %matched.meter.id, "Feature not found for meter");
                    continue;
                };

                records.push(build_feature_usage(
                    event,
                    UsageTarget {
                        customer_id: &customer.id,
                        subscription,
                        line_item,
                        price_id: &matched.price.id,
                        meter: matched.meter,
                        feature_id,
                        period_id,
                    },
                ));
            }
        }

        debug!(feature_usage_count = records.len(), "Event processing request prepared");
        Ok(records)
    }
}
