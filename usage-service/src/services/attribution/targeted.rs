use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, instrument, warn};

use super::{
    build_feature_usage, subscription_period_id, AttributionContext, TrackingStrategy,
    UsageAttributor, UsageTarget,
};
use crate::models::{
    Event, FeatureUsage, ListFeaturesFilter, ListLineItemsFilter, ListMetersFilter,
    ListSubscriptionsFilter, Meter, Subscription, SubscriptionStatus,
};
use crate::services::matcher::check_meter_filters;

/// Meter-first attribution (V2). Reads only the line items bound to meters
/// that listen to the event, and takes the price id from the line item.
pub struct TargetedAttributor {
    context: AttributionContext,
}

impl TargetedAttributor {
    pub fn new(context: AttributionContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl UsageAttributor for TargetedAttributor {
    fn strategy(&self) -> TrackingStrategy {
        TrackingStrategy::V2
    }

    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.id,
            event_name = %event.event_name,
            tenant_id = %event.tenant_id,
            strategy = "v2"
        )
    )]
    async fn attribute(&self, event: &Event) -> Result<Vec<FeatureUsage>, AppError> {
        let repos = &self.context.repos;
        let (tenant_id, environment_id) = (event.tenant_id.as_str(), event.environment_id.as_str());

        let Some(customer) = self.context.resolve_customer(event).await? else {
            return Ok(Vec::new());
        };

        let meters = repos
            .meters
            .list_meters(
                tenant_id,
                environment_id,
                &ListMetersFilter {
                    event_name: Some(event.event_name.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to get meters by event name");
                e
            })?;
        if meters.is_empty() {
            debug!("No meters found for event name, skipping");
            return Ok(Vec::new());
        }

        let meter_map: HashMap<String, Meter> = meters
            .into_iter()
            .filter(|m| check_meter_filters(event, &m.filters))
            .map(|m| (m.id.clone(), m))
            .collect();
        if meter_map.is_empty() {
            debug!("No meters match event filters, skipping");
            return Ok(Vec::new());
        }
        let meter_ids: Vec<String> = meter_map.keys().cloned().collect();

        let features = repos
            .features
            .list_features(
                tenant_id,
                environment_id,
                &ListFeaturesFilter {
                    meter_ids: meter_ids.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let feature_by_meter: HashMap<String, String> = features
            .into_iter()
            .filter_map(|f| f.meter_id.map(|meter_id| (meter_id, f.id)))
            .collect();

        let line_items = repos
            .line_items
            .list_line_items(
                tenant_id,
                environment_id,
                &ListLineItemsFilter {
                    customer_ids: vec![customer.id.clone()],
                    meter_ids,
                    active_at: Some(event.timestamp),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                error!(customer_id = %customer.id, error = %e, "Failed to get subscription line items");
                e
            })?;

        let line_items: Vec<_> = line_items
            .into_iter()
            .filter(|li| li.is_usage() && li.is_active_at(event.timestamp))
            .collect();
        if line_items.is_empty() {
            debug!(customer_id = %customer.id, "No active line items found for meters and customer, skipping");
            return Ok(Vec::new());
        }

        let subscription_ids: Vec<String> = line_items
            .iter()
            .map(|li| li.subscription_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let subscriptions = repos
            .subscriptions
            .list_subscriptions(
                tenant_id,
                environment_id,
                &ListSubscriptionsFilter {
                    subscription_ids,
                    statuses: vec![SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                    ..Default::default()
                },
            )
            .await?;
        let subscription_map: HashMap<String, Subscription> = subscriptions
            .into_iter()
            .filter(|s| s.accepts_event_at(event.timestamp))
            .map(|s| (s.id.clone(), s))
            .collect();
        if subscription_map.is_empty() {
            debug!(customer_id = %customer.id, "No valid subscriptions for event, skipping");
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for line_item in &line_items {
            let Some(subscription) = subscription_map.get(&line_item.subscription_id) else {
                debug!(
                    line_item_id = %line_item.id,
                    subscription_id = %line_item.subscription_id,
                    "Subscription not found for line item"
                );
                continue;
            };
            let Some(meter) = line_item.meter_id.as_ref().and_then(|id| meter_map.get(id)) else {
                warn!(line_item_id = %line_item.id, meter_id = ?line_item.meter_id, "Meter not found for line item");
                continue;
            };
            let Some(feature_id) = feature_by_meter.get(&meter.id) else {
                warn!(meter_id = %meter.id, "Feature not found for meter");
                continue;
            };
            let period_id = match subscription_period_id(event, subscription) {
                Ok(id) => id,
                Err(e) => {
                    error!(subscription_id = %subscription.id, error = %e, "Failed to calculate period id");
                    continue;
                }
            };

            records.push(build_feature_usage(
                event,
                UsageTarget {
                    customer_id: &customer.id,
                    subscription,
                    line_item,
                    price_id: &line_item.price_id,
                    meter,
                    feature_id,
                    period_id,
                },
            ));
        }

        debug!(feature_usage_count = records.len(), "Event processing request prepared");
        Ok(records)
    }
}
