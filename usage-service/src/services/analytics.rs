//! Usage analytics: per-customer usage with cost, commitment and grouping.

use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

use crate::models::{
    Addon, AggregationType, BucketFeatureInfo, Customer, DetailedUsageAnalytic, Feature,
    GetUsageAnalyticsRequest, GetUsageAnalyticsResponse, LineItemEntityType, ListCustomersFilter,
    ListFeaturesFilter, ListMetersFilter, ListPricesFilter, ListSubscriptionsFilter, Meter, Plan,
    Price, PriceEntityType, PriceStatus, Subscription, SubscriptionLineItem, SubscriptionStatus,
    UsageAnalyticsParams,
};
use crate::services::aggregator::aggregate_analytics_by_grouping;
use crate::services::cost::{calculate_item_cost, usage_value};
use crate::services::repository::{BucketFeatures, Repositories};

/// Everything fetched for one or more customers before costing.
#[derive(Debug, Default)]
struct AnalyticsData {
    currency: String,
    analytics: Vec<DetailedUsageAnalytic>,
    line_items: HashMap<String, SubscriptionLineItem>,
    features: HashMap<String, Feature>,
    meters: HashMap<String, Meter>,
    prices: HashMap<String, Price>,
    plans: HashMap<String, Plan>,
    addons: HashMap<String, Addon>,
}

impl AnalyticsData {
    fn merge(&mut self, other: AnalyticsData) {
        if self.currency.is_empty() {
            self.currency = other.currency;
        }
        self.analytics.extend(other.analytics);
        self.line_items.extend(other.line_items);
        self.features.extend(other.features);
        self.meters.extend(other.meters);
        self.prices.extend(other.prices);
        self.plans.extend(other.plans);
        self.addons.extend(other.addons);
    }
}

#[derive(Clone)]
pub struct UsageAnalyticsService {
    repos: Repositories,
}

impl UsageAnalyticsService {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Usage analytics for one customer, identified by external id.
    #[instrument(
        skip(self, request),
        fields(
            tenant_id = %request.tenant_id,
            external_customer_id = %request.external_customer_id
        )
    )]
    pub async fn get_detailed_usage_analytics(
        &self,
        request: &GetUsageAnalyticsRequest,
    ) -> Result<GetUsageAnalyticsResponse, AppError> {
        validate_request(request)?;
        if request.external_customer_id.is_empty() {
            return Err(AppError::ValidationError(
                "external_customer_id is required".to_string(),
            ));
        }

        let customer = self.fetch_customer(request).await?;
        let data = self.fetch_analytics_data(request, &customer).await?;
        Ok(build_response(data, &request.group_by))
    }

    /// Usage analytics across customers. No external ids means every
    /// customer in the environment. Customers whose data cannot be fetched
    /// are skipped; customers billed in different currencies are rejected.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id))]
    pub async fn get_detailed_usage_analytics_v2(
        &self,
        request: &GetUsageAnalyticsRequest,
    ) -> Result<GetUsageAnalyticsResponse, AppError> {
        validate_request(request)?;

        let filter = ListCustomersFilter {
            external_ids: request.external_customer_ids.clone(),
        };
        let customers = self
            .repos
            .customers
            .list_customers(&request.tenant_id, &request.environment_id, &filter)
            .await?;

        let mut merged: Option<AnalyticsData> = None;
        for customer in &customers {
            let data = match self.fetch_analytics_data(request, customer).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        customer_id = %customer.id,
                        external_customer_id = %customer.external_id,
                        error = %e,
                        "Failed to fetch analytics data for customer, skipping"
                    );
                    continue;
                }
            };

            match merged.as_mut() {
                None => merged = Some(data),
                Some(existing) => {
                    if !data.currency.is_empty()
                        && !existing.currency.is_empty()
                        && data.currency != existing.currency
                    {
                        return Err(AppError::ValidationError(format!(
                            "multiple currencies detected across customers: expected {}, found {} for customer {}",
                            existing.currency, data.currency, customer.id
                        )));
                    }
                    existing.merge(data);
                }
            }
        }

        Ok(match merged {
            Some(data) => build_response(data, &request.group_by),
            None => GetUsageAnalyticsResponse {
                total_cost: Decimal::ZERO,
                currency: String::new(),
                items: Vec::new(),
            },
        })
    }

    async fn fetch_customer(&self, request: &GetUsageAnalyticsRequest) -> Result<Customer, AppError> {
        self.repos
            .customers
            .get_customer_by_external_id(
                &request.tenant_id,
                &request.environment_id,
                &request.external_customer_id,
            )
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Customer not found for external id {}",
                    request.external_customer_id
                ))
            })
    }

    async fn fetch_analytics_data(
        &self,
        request: &GetUsageAnalyticsRequest,
        customer: &Customer,
    ) -> Result<AnalyticsData, AppError> {
        let subscriptions = self
            .repos
            .subscriptions
            .list_subscriptions(
                &request.tenant_id,
                &request.environment_id,
                &ListSubscriptionsFilter {
                    customer_ids: vec![customer.id.clone()],
                    statuses: vec![
                        SubscriptionStatus::Active,
                        SubscriptionStatus::Trialing,
                        SubscriptionStatus::Paused,
                        SubscriptionStatus::Cancelled,
                    ],
                    with_line_items: true,
                    ..Default::default()
                },
            )
            .await?;

        let currency = validate_currency(&subscriptions)?;

        let mut params = UsageAnalyticsParams {
            tenant_id: request.tenant_id.clone(),
            environment_id: request.environment_id.clone(),
            customer_id: customer.id.clone(),
            external_customer_id: customer.external_id.clone(),
            feature_ids: request.feature_ids.clone(),
            sources: request.sources.clone(),
            start_time: request.start_time,
            end_time: request.end_time,
            group_by: request.group_by.clone(),
            window_size: request.window_size,
            property_filters: request.property_filters.clone(),
        };

        let (max_buckets, sum_buckets) = self.build_bucket_features(&mut params).await?;
        let analytics = self
            .repos
            .feature_usage
            .get_detailed_usage_analytics(&params, &max_buckets, &sum_buckets)
            .await?;

        let mut data = AnalyticsData {
            currency,
            analytics,
            ..Default::default()
        };
        for subscription in subscriptions {
            for line_item in subscription.line_items {
                data.line_items.insert(line_item.id.clone(), line_item);
            }
        }

        if !data.analytics.is_empty() {
            if let Err(e) = self.enrich_with_metadata(&params, &mut data).await {
                warn!(
                    customer_id = %customer.id,
                    analytics_count = data.analytics.len(),
                    error = %e,
                    "Failed to enrich analytics with metadata"
                );
            }
        }
        Ok(data)
    }

    /// Bucketed max and sum features among the requested ones. With no
    /// requested features every feature of the environment is considered
    /// and `params.feature_ids` is filled in.
    async fn build_bucket_features(
        &self,
        params: &mut UsageAnalyticsParams,
    ) -> Result<(BucketFeatures, BucketFeatures), AppError> {
        let features = self
            .repos
            .features
            .list_features(
                &params.tenant_id,
                &params.environment_id,
                &ListFeaturesFilter {
                    feature_ids: params.feature_ids.clone(),
                    ..Default::default()
                },
            )
            .await?;

        if params.feature_ids.is_empty() {
            params.feature_ids = features.iter().map(|f| f.id.clone()).collect();
            debug!(count = params.feature_ids.len(), "Fetched feature ids for analytics");
        }

        let meter_ids = unique(features.iter().filter_map(|f| f.meter_id.clone()));
        let mut max_buckets = BucketFeatures::new();
        let mut sum_buckets = BucketFeatures::new();
        if meter_ids.is_empty() {
            return Ok((max_buckets, sum_buckets));
        }

        let meters: HashMap<String, Meter> = self
            .repos
            .meters
            .list_meters(
                &params.tenant_id,
                &params.environment_id,
                &ListMetersFilter {
                    meter_ids,
                    ..Default::default()
                },
            )
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        for feature in &features {
            let Some(meter) = feature.meter_id.as_ref().and_then(|id| meters.get(id)) else {
                continue;
            };
            let Some(bucket_size) = meter.aggregation.bucket_size else {
                continue;
            };
            let info = BucketFeatureInfo {
                feature_id: feature.id.clone(),
                meter_id: meter.id.clone(),
                event_name: meter.event_name.clone(),
                bucket_size,
                aggregation: meter.aggregation.clone(),
            };
            if meter.is_bucketed_max_meter() {
                max_buckets.insert(feature.id.clone(), info);
            } else if meter.is_bucketed_sum_meter() {
                sum_buckets.insert(feature.id.clone(), info);
            }
        }
        Ok((max_buckets, sum_buckets))
    }

    async fn enrich_with_metadata(
        &self,
        params: &UsageAnalyticsParams,
        data: &mut AnalyticsData,
    ) -> Result<(), AppError> {
        let tenant_id = params.tenant_id.as_str();
        let environment_id = params.environment_id.as_str();

        let feature_ids = unique(
            data.analytics
                .iter()
                .map(|a| a.feature_id.clone())
                .filter(|id| !id.is_empty()),
        );
        if feature_ids.is_empty() {
            return Ok(());
        }

        let features = self
            .repos
            .features
            .list_features(
                tenant_id,
                environment_id,
                &ListFeaturesFilter {
                    feature_ids,
                    ..Default::default()
                },
            )
            .await?;
        let meter_ids = unique(features.iter().filter_map(|f| f.meter_id.clone()));
        data.features
            .extend(features.into_iter().map(|f| (f.id.clone(), f)));

        if !meter_ids.is_empty() {
            let meters = self
                .repos
                .meters
                .list_meters(
                    tenant_id,
                    environment_id,
                    &ListMetersFilter {
                        meter_ids,
                        ..Default::default()
                    },
                )
                .await?;
            data.meters
                .extend(meters.into_iter().map(|m| (m.id.clone(), m)));
        }

        self.fetch_line_item_prices(tenant_id, environment_id, data)
            .await?;
        self.fetch_plans_and_addons(tenant_id, environment_id, data)
            .await?;

        for item in &mut data.analytics {
            let Some(feature) = data.features.get(&item.feature_id) else {
                continue;
            };
            item.feature_name = feature.name.clone();
            item.unit = feature.unit_singular.clone();
            item.unit_plural = feature.unit_plural.clone();
            if let Some(meter) = feature.meter_id.as_ref().and_then(|id| data.meters.get(id)) {
                item.meter_id = meter.id.clone();
                item.event_name = meter.event_name.clone();
                item.aggregation_type = meter.aggregation.aggregation_type;
            }
        }
        Ok(())
    }

    /// Prices of the customer's usage line items, plus the plan or addon
    /// parents of subscription-level overrides. Expired prices are included
    /// so historical usage still prices after an override.
    async fn fetch_line_item_prices(
        &self,
        tenant_id: &str,
        environment_id: &str,
        data: &mut AnalyticsData,
    ) -> Result<(), AppError> {
        let price_ids = unique(
            data.line_items
                .values()
                .filter(|li| li.is_usage() && li.meter_id.is_some() && !li.price_id.is_empty())
                .map(|li| li.price_id.clone()),
        );
        if price_ids.is_empty() {
            return Ok(());
        }

        let prices = self
            .list_prices(tenant_id, environment_id, price_ids)
            .await?;
        let parent_ids = unique(
            prices
                .iter()
                .filter(|p| p.entity_type == PriceEntityType::Subscription)
                .filter_map(|p| p.parent_price_id.clone()),
        );
        data.prices
            .extend(prices.into_iter().map(|p| (p.id.clone(), p)));

        if !parent_ids.is_empty() {
            let parents = self
                .list_prices(tenant_id, environment_id, parent_ids)
                .await?;
            data.prices
                .extend(parents.into_iter().map(|p| (p.id.clone(), p)));
        }
        Ok(())
    }

    async fn list_prices(
        &self,
        tenant_id: &str,
        environment_id: &str,
        price_ids: Vec<String>,
    ) -> Result<Vec<Price>, AppError> {
        self.repos
            .prices
            .list_prices(
                tenant_id,
                environment_id,
                &ListPricesFilter {
                    price_ids,
                    statuses: vec![PriceStatus::Published],
                    allow_expired: true,
                    ..Default::default()
                },
            )
            .await
    }

    async fn fetch_plans_and_addons(
        &self,
        tenant_id: &str,
        environment_id: &str,
        data: &mut AnalyticsData,
    ) -> Result<(), AppError> {
        let mut plan_ids = Vec::new();
        let mut addon_ids = Vec::new();
        for item in &data.analytics {
            match owner_of(item, data) {
                Some(Owner::Plan(id)) => plan_ids.push(id),
                Some(Owner::Addon(id)) => addon_ids.push(id),
                None => {}
            }
        }

        let plan_ids = unique(plan_ids.into_iter());
        if !plan_ids.is_empty() {
            let plans = self
                .repos
                .plans
                .list_plans(tenant_id, environment_id, &plan_ids)
                .await?;
            data.plans
                .extend(plans.into_iter().map(|p| (p.id.clone(), p)));
        }

        let addon_ids = unique(addon_ids.into_iter());
        if !addon_ids.is_empty() {
            let addons = self
                .repos
                .addons
                .list_addons(tenant_id, environment_id, &addon_ids)
                .await?;
            data.addons
                .extend(addons.into_iter().map(|a| (a.id.clone(), a)));
        }
        Ok(())
    }
}

enum Owner {
    Plan(String),
    Addon(String),
}

/// Plan or addon an analytics item is billed under. Subscription overrides
/// resolve through their parent price; line items are the fallback.
fn owner_of(item: &DetailedUsageAnalytic, data: &AnalyticsData) -> Option<Owner> {
    let from_price = |price: &Price| match price.entity_type {
        PriceEntityType::Plan => Some(Owner::Plan(price.entity_id.clone())),
        PriceEntityType::Addon => Some(Owner::Addon(price.entity_id.clone())),
        PriceEntityType::Subscription => None,
    };

    if let Some(price) = data.prices.get(&item.price_id) {
        let owner = match price.entity_type {
            PriceEntityType::Subscription => price
                .parent_price_id
                .as_ref()
                .and_then(|id| data.prices.get(id))
                .and_then(from_price),
            _ => from_price(price),
        };
        if owner.is_some() {
            return owner;
        }
    }

    data.line_items
        .get(&item.sub_line_item_id)
        .map(|li| match li.entity_type {
            LineItemEntityType::Plan => Owner::Plan(li.entity_id.clone()),
            LineItemEntityType::Addon => Owner::Addon(li.entity_id.clone()),
        })
}

fn build_response(mut data: AnalyticsData, group_by: &[String]) -> GetUsageAnalyticsResponse {
    let analytics = std::mem::take(&mut data.analytics);
    let mut analytics: Vec<DetailedUsageAnalytic> = analytics
        .into_iter()
        .map(|mut item| {
            calculate_costs(&mut item, &data);
            if !data.currency.is_empty() {
                item.currency = data.currency.clone();
            }
            attach_owner(&mut item, &data);
            item
        })
        .collect();

    analytics = aggregate_analytics_by_grouping(analytics, group_by);

    for item in &mut analytics {
        if item.aggregation_type != AggregationType::Max || item.total_usage.is_zero() {
            item.total_usage = usage_value(item, item.aggregation_type);
        }
    }
    analytics.sort_by(|a, b| a.feature_name.cmp(&b.feature_name));

    let total_cost = analytics.iter().map(|a| a.total_cost).sum();
    let currency = if data.currency.is_empty() {
        analytics
            .iter()
            .map(|a| a.currency.clone())
            .find(|c| !c.is_empty())
            .unwrap_or_default()
    } else {
        data.currency
    };

    GetUsageAnalyticsResponse {
        total_cost,
        currency,
        items: analytics,
    }
}

fn calculate_costs(item: &mut DetailedUsageAnalytic, data: &AnalyticsData) {
    let Some(feature) = data.features.get(&item.feature_id) else {
        return;
    };
    let Some(meter) = feature.meter_id.as_ref().and_then(|id| data.meters.get(id)) else {
        return;
    };
    let Some(price) = data.prices.get(&item.price_id) else {
        debug!(
            feature_id = %item.feature_id,
            price_id = %item.price_id,
            "No price found for analytics item"
        );
        return;
    };
    let line_item = data.line_items.get(&item.sub_line_item_id);
    calculate_item_cost(item, meter, price, line_item);
}

fn attach_owner(item: &mut DetailedUsageAnalytic, data: &AnalyticsData) {
    match owner_of(item, data) {
        Some(Owner::Plan(id)) => {
            item.plan_name = data.plans.get(&id).map(|p| p.name.clone());
            item.plan_id = Some(id);
        }
        Some(Owner::Addon(id)) => {
            item.addon_name = data.addons.get(&id).map(|a| a.name.clone());
            item.addon_id = Some(id);
        }
        None => {}
    }
}

fn validate_request(request: &GetUsageAnalyticsRequest) -> Result<(), AppError> {
    if request.tenant_id.is_empty() || request.environment_id.is_empty() {
        return Err(AppError::ValidationError(
            "tenant_id and environment_id are required".to_string(),
        ));
    }
    if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
        if start >= end {
            return Err(AppError::ValidationError(
                "start_time must be before end_time".to_string(),
            ));
        }
    }
    Ok(())
}

/// The single currency of `subscriptions`, empty when there are none.
fn validate_currency(subscriptions: &[Subscription]) -> Result<String, AppError> {
    let Some(first) = subscriptions.first() else {
        return Ok(String::new());
    };
    if let Some(other) = subscriptions.iter().find(|s| s.currency != first.currency) {
        return Err(AppError::ValidationError(format!(
            "multiple currencies detected for customer {}",
            other.customer_id
        )));
    }
    Ok(first.currency.clone())
}

/// Deduplicates while keeping first-seen order.
fn unique(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}
