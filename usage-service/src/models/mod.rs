//! Domain models for usage-service.

/// Implements the text conversions used for TEXT columns and wire payloads:
/// `as_str`, `Display`, `FromStr` and `TryFrom<String>`.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(anyhow::anyhow!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    )),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

mod analytics;
mod customer;
mod event;
mod feature;
mod meter;
mod plan;
mod price;
mod subscription;
mod usage;
mod workflow;

pub use analytics::{
    BenchmarkResult, GetUsageAnalyticsRequest, GetUsageAnalyticsResponse, ReprocessEventsRequest,
    ReprocessEventsSummary, WorkflowRun,
};
pub use customer::{Customer, ListCustomersFilter};
pub use event::{Event, FeatureUsage};
pub use feature::{Feature, ListFeaturesFilter};
pub use meter::{
    AggregationType, ListMetersFilter, Meter, MeterAggregation, MeterFilter, WindowSize,
};
pub use plan::{Addon, Plan};
pub use price::{
    BillingModel, ListPricesFilter, Price, PriceEntityType, PriceStatus, PriceTier, PriceType,
    RoundingMode, TierMode, TransformQuantity,
};
pub use subscription::{
    BillingPeriod, Commitment, LineItemEntityType, LineItemStatus, ListLineItemsFilter,
    ListSubscriptionsFilter, Subscription, SubscriptionLineItem, SubscriptionStatus,
};
pub use usage::{
    BucketFeatureInfo, CommitmentInfo, DetailedUsageAnalytic, ReprocessEventsParams,
    UsageAnalyticPoint, UsageAnalyticsParams,
};
pub use workflow::{
    CustomerOnboardingInput, CustomerOnboardingResult, OnboardingActionResult, WorkflowAction,
    WorkflowActionConfig, WorkflowConfig, WorkflowStatus, CUSTOMER_ONBOARDING_WORKFLOW,
    REPROCESS_EVENTS_WORKFLOW,
};
