//! Configuration module for usage-service.

use service_core::config::{
    self as core_config, env_or, optional_env, require_env, ServiceIdentity,
};
use service_core::error::AppError;
use std::time::Duration;

use crate::services::attribution::TrackingStrategy;
use crate::services::tracking::TrackingSettings;

#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub common: core_config::Config,
    pub identity: ServiceIdentity,
    pub database: DatabaseConfig,
    pub pubsub: PubSubConfig,
    pub workflow: WorkflowConfig,
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct PubSubConfig {
    pub redis_url: String,
    pub events_topic: String,
    pub backfill_topic: String,
    pub consumer_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// No executor URL disables customer auto-provisioning.
    pub executor_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub strategy: TrackingStrategy,
    pub onboarding_timeout: Duration,
    pub reprocess_batch_size: usize,
}

impl UsageConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let strategy = optional_env("TRACKING_STRATEGY")
            .map(|s| s.parse::<TrackingStrategy>())
            .transpose()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("TRACKING_STRATEGY: {}", e)))?
            .unwrap_or(TrackingStrategy::V2);

        Ok(Self {
            common,
            identity: ServiceIdentity::from_env("usage-service", env!("CARGO_PKG_VERSION")),
            database: DatabaseConfig {
                url: require_env("DATABASE_URL")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            pubsub: PubSubConfig {
                redis_url: require_env("REDIS_URL")?,
                events_topic: env_or("EVENTS_TOPIC", "events".to_string()),
                backfill_topic: env_or("EVENTS_BACKFILL_TOPIC", "events_backfill".to_string()),
                consumer_enabled: env_or("CONSUMER_ENABLED", true),
            },
            workflow: WorkflowConfig {
                executor_url: optional_env("WORKFLOW_EXECUTOR_URL"),
            },
            tracking: TrackingConfig {
                strategy,
                onboarding_timeout: Duration::from_secs(env_or("ONBOARDING_TIMEOUT_SECS", 30)),
                reprocess_batch_size: env_or("REPROCESS_BATCH_SIZE", 100),
            },
        })
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            events_topic: self.pubsub.events_topic.clone(),
            backfill_topic: self.pubsub.backfill_topic.clone(),
            strategy: self.tracking.strategy,
            reprocess_batch_size: self.tracking.reprocess_batch_size,
            ..TrackingSettings::default()
        }
    }
}
