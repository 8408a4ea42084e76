//! Event-to-usage attribution.
//!
//! Two strategies implement the same contract over the same repositories and
//! must produce the same records for the same data:
//!
//! - [`BroadScanAttributor`] loads every active subscription of the customer
//!   with its line items, then matches prices and meters against them.
//! - [`TargetedAttributor`] narrows meters by event name first, then loads
//!   only the line items bound to those meters.

mod broad_scan;
mod targeted;

pub use broad_scan::BroadScanAttributor;
pub use targeted::TargetedAttributor;

use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::{
    Customer, CustomerOnboardingInput, CustomerOnboardingResult, Event, FeatureUsage, Meter,
    Subscription, SubscriptionLineItem, WorkflowStatus, CUSTOMER_ONBOARDING_WORKFLOW,
};
use crate::services::dedup::unique_hash;
use crate::services::period::calculate_period_id;
use crate::services::quantity::extract_quantity;
use crate::services::repository::Repositories;
use crate::services::workflow::WorkflowExecutor;

/// Default bound on synchronous customer onboarding.
pub const DEFAULT_ONBOARDING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingStrategy {
    V1,
    V2,
}

impl TrackingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStrategy::V1 => "v1",
            TrackingStrategy::V2 => "v2",
        }
    }
}

impl fmt::Display for TrackingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" => Ok(TrackingStrategy::V1),
            "v2" => Ok(TrackingStrategy::V2),
            other => Err(AppError::ValidationError(format!(
                "unknown tracking strategy: {}",
                other
            ))),
        }
    }
}

/// Resolves one event to the feature usage records it produces.
///
/// `Ok(vec![])` means nothing to bill (terminal). Errors are for the caller
/// to retry according to [`AppError::is_retryable`].
#[async_trait]
pub trait UsageAttributor: Send + Sync {
    fn strategy(&self) -> TrackingStrategy;

    async fn attribute(&self, event: &Event) -> Result<Vec<FeatureUsage>, AppError>;
}

/// Dependencies shared by both strategies.
#[derive(Clone)]
pub struct AttributionContext {
    pub repos: Repositories,
    pub workflow_executor: Option<Arc<dyn WorkflowExecutor>>,
    pub onboarding_timeout: Duration,
}

impl AttributionContext {
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            workflow_executor: None,
            onboarding_timeout: DEFAULT_ONBOARDING_TIMEOUT,
        }
    }

    pub fn with_workflow_executor(mut self, executor: Arc<dyn WorkflowExecutor>) -> Self {
        self.workflow_executor = Some(executor);
        self
    }

    pub fn with_onboarding_timeout(mut self, timeout: Duration) -> Self {
        self.onboarding_timeout = timeout;
        self
    }

    /// Customer for the event's external id, auto-provisioned when the
    /// environment is configured for it. `Ok(None)` means skip the event.
    pub async fn resolve_customer(&self, event: &Event) -> Result<Option<Customer>, AppError> {
        let existing = self
            .repos
            .customers
            .get_customer_by_external_id(
                &event.tenant_id,
                &event.environment_id,
                &event.external_customer_id,
            )
            .await?;
        if let Some(customer) = existing {
            return Ok(Some(customer));
        }

        warn!(
            event_id = %event.id,
            external_customer_id = %event.external_customer_id,
            "Customer not found for event"
        );

        let customer = self.handle_missing_customer(event).await.map_err(|e| {
            error!(
                event_id = %event.id,
                external_customer_id = %event.external_customer_id,
                error = %e,
                "Failed to handle missing customer"
            );
            e
        })?;

        match &customer {
            Some(c) => info!(
                event_id = %event.id,
                external_customer_id = %event.external_customer_id,
                customer_id = %c.id,
                "Customer auto-created via workflow"
            ),
            None => info!(
                event_id = %event.id,
                external_customer_id = %event.external_customer_id,
                "Skipping event: no customer and no auto-creation workflow configured"
            ),
        }
        Ok(customer)
    }

    async fn handle_missing_customer(&self, event: &Event) -> Result<Option<Customer>, AppError> {
        let config = match self
            .repos
            .settings
            .get_onboarding_config(&event.tenant_id, &event.environment_id)
            .await
        {
            Ok(config) => config,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                debug!(event_id = %event.id, error = %e, "Failed to get workflow config");
                None
            }
        };

        let Some(config) = config.filter(|c| !c.actions.is_empty()) else {
            debug!(event_id = %event.id, "No workflow config found for customer onboarding");
            return Ok(None);
        };
        if !config.starts_with_create_customer() {
            debug!(
                event_id = %event.id,
                "Workflow config does not have create_customer as first action"
            );
            return Ok(None);
        }
        let Some(executor) = self.workflow_executor.as_ref() else {
            debug!(event_id = %event.id, "No workflow executor configured");
            return Ok(None);
        };

        info!(
            event_id = %event.id,
            external_customer_id = %event.external_customer_id,
            action_count = config.actions.len(),
            "Executing customer onboarding workflow synchronously"
        );

        let input = CustomerOnboardingInput {
            external_customer_id: event.external_customer_id.clone(),
            event_timestamp: Some(event.timestamp),
            tenant_id: event.tenant_id.clone(),
            environment_id: event.environment_id.clone(),
            workflow_config: config,
        };
        input.validate()?;

        let payload = serde_json::to_value(&input).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to encode onboarding input: {}", e))
        })?;
        let raw = tokio::time::timeout(
            self.onboarding_timeout,
            executor.execute_workflow_sync(
                CUSTOMER_ONBOARDING_WORKFLOW,
                payload,
                self.onboarding_timeout,
            ),
        )
        .await
        .map_err(|_| {
            AppError::InternalError(anyhow::anyhow!(
                "Customer onboarding workflow timed out after {:?}",
                self.onboarding_timeout
            ))
        })?
        .map_err(|e| {
            AppError::InternalError(anyhow::anyhow!(
                "Failed to execute customer onboarding workflow: {}",
                e
            ))
        })?;

        let result: CustomerOnboardingResult = serde_json::from_value(raw).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Invalid onboarding workflow result: {}", e))
        })?;

        if result.status != WorkflowStatus::Completed {
            let message = result
                .error_summary
                .clone()
                .unwrap_or_else(|| "workflow did not complete successfully".to_string());
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Customer onboarding workflow failed after {} actions: {}",
                result.actions_executed,
                message
            )));
        }

        let Some(customer_id) = result.created_customer_id() else {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Customer ID not found in workflow results"
            )));
        };

        let customer = self
            .repos
            .customers
            .get_customer(&event.tenant_id, &event.environment_id, customer_id)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to fetch created customer {}: {}",
                    customer_id,
                    e
                ))
            })?;

        info!(
            event_id = %event.id,
            customer_id = %customer.id,
            actions_executed = result.actions_executed,
            "Customer onboarding workflow completed"
        );
        Ok(Some(customer))
    }
}

/// Builds the configured strategy.
pub fn attributor_for(
    strategy: TrackingStrategy,
    context: AttributionContext,
) -> Arc<dyn UsageAttributor> {
    match strategy {
        TrackingStrategy::V1 => Arc::new(BroadScanAttributor::new(context)),
        TrackingStrategy::V2 => Arc::new(TargetedAttributor::new(context)),
    }
}

/// Period id of `event` within `subscription`'s billing cadence.
pub(crate) fn subscription_period_id(
    event: &Event,
    subscription: &Subscription,
) -> Result<u64, AppError> {
    calculate_period_id(
        event.timestamp,
        subscription.start_date,
        subscription.current_period_start,
        subscription.current_period_end,
        subscription.billing_anchor,
        subscription.billing_period_count,
        subscription.billing_period,
    )
}

/// What one usage record is attributed to.
pub(crate) struct UsageTarget<'a> {
    pub customer_id: &'a str,
    pub subscription: &'a Subscription,
    pub line_item: &'a SubscriptionLineItem,
    pub price_id: &'a str,
    pub meter: &'a Meter,
    pub feature_id: &'a str,
    pub period_id: u64,
}

pub(crate) fn build_feature_usage(event: &Event, target: UsageTarget<'_>) -> FeatureUsage {
    let (mut quantity, _) =
        extract_quantity(event, target.meter, target.subscription, target.period_id);
    if quantity < Decimal::ZERO {
        warn!(
            event_id = %event.id,
            meter_id = %target.meter.id,
            calculated_quantity = %quantity,
            "Negative quantity calculated, setting to zero"
        );
        quantity = Decimal::ZERO;
    }

    let mut usage_event = event.clone();
    if usage_event.customer_id.is_empty() {
        usage_event.customer_id = target.customer_id.to_string();
    }

    FeatureUsage {
        event: usage_event,
        subscription_id: target.subscription.id.clone(),
        sub_line_item_id: target.line_item.id.clone(),
        price_id: target.price_id.to_string(),
        meter_id: target.meter.id.clone(),
        feature_id: target.feature_id.to_string(),
        period_id: target.period_id,
        unique_hash: unique_hash(event, target.meter),
        qty_total: quantity,
        sign: 1,
    }
}
