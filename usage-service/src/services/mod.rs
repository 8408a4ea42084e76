//! Services module for usage-service.

pub mod aggregator;
pub mod analytics;
pub mod attribution;
pub mod commitment;
pub mod cost;
pub mod database;
pub mod dedup;
pub mod in_memory;
pub mod matcher;
pub mod metrics;
pub mod period;
pub mod pricing;
pub mod pubsub;
pub mod quantity;
pub mod repository;
pub mod tracking;
pub mod workflow;

pub use analytics::UsageAnalyticsService;
pub use attribution::{AttributionContext, TrackingStrategy, UsageAttributor};
pub use database::Database;
pub use in_memory::InMemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_attribution_duration, record_event_outcome,
    record_events_reprocessed, record_feature_usage_written,
};
pub use pubsub::{InMemoryPubSub, Message, PubSub, RedisPubSub};
pub use repository::Repositories;
pub use tracking::{DeliveryOutcome, FeatureUsageTrackingService, TrackingSettings};
pub use workflow::{HttpWorkflowExecutor, WorkflowExecutor};
