//! Feature usage tracking: event publishing, consumption, reprocessing and
//! strategy benchmarking.

use chrono::{DateTime, Utc};
use service_core::error::AppError;
use service_core::observability::inject_trace_metadata;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::models::{
    BenchmarkResult, Event, FeatureUsage, ReprocessEventsParams, ReprocessEventsRequest,
    ReprocessEventsSummary, WorkflowRun, REPROCESS_EVENTS_WORKFLOW,
};
use crate::services::attribution::{
    attributor_for, AttributionContext, TrackingStrategy, UsageAttributor,
};
use crate::services::metrics::{
    record_attribution_duration, record_event_outcome, record_events_reprocessed,
    record_feature_usage_written,
};
use crate::services::pubsub::{
    Message, PubSub, METADATA_ENVIRONMENT_ID, METADATA_PARTITION_KEY, METADATA_RETRY_COUNT,
    METADATA_TENANT_ID,
};
use crate::services::repository::Repositories;
use crate::services::workflow::WorkflowExecutor;

/// Redelivery attempts before a failing message is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub events_topic: String,
    pub backfill_topic: String,
    pub strategy: TrackingStrategy,
    pub reprocess_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            events_topic: "events".to_string(),
            backfill_topic: "events_backfill".to_string(),
            strategy: TrackingStrategy::V2,
            reprocess_batch_size: ReprocessEventsParams::DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Handled,
    Redelivered,
    Abandoned,
}

#[derive(Clone)]
pub struct FeatureUsageTrackingService {
    repos: Repositories,
    pubsub: Arc<dyn PubSub>,
    workflow_executor: Option<Arc<dyn WorkflowExecutor>>,
    attributor: Arc<dyn UsageAttributor>,
    broad_scan: Arc<dyn UsageAttributor>,
    targeted: Arc<dyn UsageAttributor>,
    settings: TrackingSettings,
    /// Redeliveries still waiting out their delay.
    redeliveries: TaskTracker,
    flush_redeliveries: CancellationToken,
}

impl FeatureUsageTrackingService {
    pub fn new(
        context: AttributionContext,
        pubsub: Arc<dyn PubSub>,
        settings: TrackingSettings,
    ) -> Self {
        let broad_scan = attributor_for(TrackingStrategy::V1, context.clone());
        let targeted = attributor_for(TrackingStrategy::V2, context.clone());
        let attributor = match settings.strategy {
            TrackingStrategy::V1 => broad_scan.clone(),
            TrackingStrategy::V2 => targeted.clone(),
        };

        Self {
            repos: context.repos.clone(),
            pubsub,
            workflow_executor: context.workflow_executor.clone(),
            attributor,
            broad_scan,
            targeted,
            settings,
            redeliveries: TaskTracker::new(),
            flush_redeliveries: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &TrackingSettings {
        &self.settings
    }

    pub fn topics(&self) -> [&str; 2] {
        [&self.settings.events_topic, &self.settings.backfill_topic]
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Publishes `event` for asynchronous attribution. Backfill events go to
    /// the backfill topic so that live traffic is not starved.
    #[instrument(skip(self, event), fields(event_id = %event.id, tenant_id = %event.tenant_id))]
    pub async fn publish_event(&self, event: &Event, is_backfill: bool) -> Result<(), AppError> {
        let payload = serde_json::to_vec(event).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to marshal event: {}", e))
        })?;

        let mut message = Message::new(payload);
        message.uuid = format!("{}-{}", event.id, message.uuid);
        message
            .metadata
            .insert(METADATA_TENANT_ID.to_string(), event.tenant_id.clone());
        message.metadata.insert(
            METADATA_ENVIRONMENT_ID.to_string(),
            event.environment_id.clone(),
        );
        message
            .metadata
            .insert(METADATA_PARTITION_KEY.to_string(), partition_key(event));
        inject_trace_metadata(&mut message.metadata);

        let topic = if is_backfill {
            &self.settings.backfill_topic
        } else {
            &self.settings.events_topic
        };

        debug!(
            event_id = %event.id,
            event_name = %event.event_name,
            topic = %topic,
            "Publishing event for feature usage tracking"
        );
        self.pubsub.publish(topic, message).await
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    /// Handles one delivered message. Malformed payloads and events without
    /// a tenant or environment are dropped; any other error is for the
    /// caller to redeliver.
    pub async fn process_message(&self, message: &Message) -> Result<(), AppError> {
        let mut event: Event = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    message_uuid = %message.uuid,
                    error = %e,
                    "Failed to unmarshal event for feature usage tracking"
                );
                record_event_outcome("unknown", "dropped");
                return Ok(());
            }
        };

        let tenant_id = message
            .metadata_value(METADATA_TENANT_ID)
            .map(str::to_string)
            .unwrap_or_else(|| event.tenant_id.clone());
        let environment_id = message
            .metadata_value(METADATA_ENVIRONMENT_ID)
            .map(str::to_string)
            .unwrap_or_else(|| event.environment_id.clone());

        if tenant_id.is_empty() || environment_id.is_empty() {
            error!(
                message_uuid = %message.uuid,
                event_id = %event.id,
                "Invalid tenant or environment id in message"
            );
            record_event_outcome("unknown", "dropped");
            return Ok(());
        }

        event.tenant_id = tenant_id;
        event.environment_id = environment_id;

        self.process_event(&event).await.map(|_| ())
    }

    /// Attributes `event` with the configured strategy and stores the result.
    /// Returns the number of newly inserted records.
    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.id,
            event_name = %event.event_name,
            tenant_id = %event.tenant_id,
            strategy = %self.attributor.strategy()
        )
    )]
    pub async fn process_event(&self, event: &Event) -> Result<usize, AppError> {
        let records = match self.prepare(self.attributor.as_ref(), event).await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    event_id = %event.id,
                    event_name = %event.event_name,
                    error = %e,
                    "Failed to prepare feature usage for event"
                );
                record_event_outcome(&event.tenant_id, "failed");
                return Err(e);
            }
        };

        if records.is_empty() {
            debug!(event_id = %event.id, "No feature usage produced for event");
            record_event_outcome(&event.tenant_id, "skipped");
            return Ok(0);
        }

        let inserted = self
            .repos
            .feature_usage
            .bulk_insert(&records)
            .await
            .map_err(|e| {
                error!(
                    event_id = %event.id,
                    event_name = %event.event_name,
                    error = %e,
                    "Failed to insert feature usage records"
                );
                record_event_outcome(&event.tenant_id, "failed");
                e
            })?;

        if inserted < records.len() {
            debug!(
                event_id = %event.id,
                produced = records.len(),
                inserted = inserted,
                "Duplicate feature usage records ignored"
            );
        }

        record_event_outcome(&event.tenant_id, "processed");
        record_feature_usage_written(&event.tenant_id, inserted);
        Ok(inserted)
    }

    /// Processes a delivery and re-publishes retryable failures to the same
    /// topic after `retry_delay`, up to `max_retries` attempts.
    pub async fn handle_delivery(&self, topic: &str, message: Message) -> DeliveryOutcome {
        let error = match self.process_message(&message).await {
            Ok(()) => return DeliveryOutcome::Handled,
            Err(e) => e,
        };

        let attempt = message.retry_count() + 1;
        if !error.is_retryable() || attempt > self.settings.max_retries {
            error!(
                message_uuid = %message.uuid,
                topic = %topic,
                attempt = attempt,
                error = %error,
                "Abandoning event after processing failure"
            );
            return DeliveryOutcome::Abandoned;
        }

        warn!(
            message_uuid = %message.uuid,
            topic = %topic,
            attempt = attempt,
            error = %error,
            "Scheduling event redelivery"
        );

        let mut retry = message;
        retry
            .metadata
            .insert(METADATA_RETRY_COUNT.to_string(), attempt.to_string());
        let pubsub = self.pubsub.clone();
        let topic = topic.to_string();
        let delay = self.settings.retry_delay;
        let flush = self.flush_redeliveries.clone();
        self.redeliveries.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = flush.cancelled() => {}
            }
            if let Err(e) = pubsub.publish(&topic, retry).await {
                error!(topic = %topic, error = %e, "Failed to redeliver event");
            }
        });
        DeliveryOutcome::Redelivered
    }

    /// Publishes every pending redelivery now, skipping what is left of its
    /// delay, and waits for them. Called once consumers have stopped.
    pub async fn drain_redeliveries(&self) {
        let pending = self.redeliveries.len();
        if pending > 0 {
            info!(pending = pending, "Flushing pending redeliveries");
        }
        self.flush_redeliveries.cancel();
        self.redeliveries.close();
        self.redeliveries.wait().await;
    }

    // =========================================================================
    // Reprocessing
    // =========================================================================

    /// Re-publishes every unprocessed event matching `params` to the backfill
    /// topic, one keyset page at a time.
    #[instrument(skip(self, params), fields(tenant_id = %params.tenant_id))]
    pub async fn reprocess_events(
        &self,
        params: ReprocessEventsParams,
    ) -> Result<ReprocessEventsSummary, AppError> {
        let mut params = params;
        if params.batch_size == 0 {
            params.batch_size = self.settings.reprocess_batch_size;
        }
        let batch_size = params.batch_size;

        info!(
            external_customer_id = ?params.external_customer_id,
            event_name = ?params.event_name,
            start_time = ?params.start_time,
            end_time = ?params.end_time,
            batch_size = batch_size,
            "Starting event reprocessing"
        );

        let mut summary = ReprocessEventsSummary::default();
        let mut last_id: Option<String> = None;
        let mut last_timestamp: Option<DateTime<Utc>> = None;

        loop {
            let events = self
                .repos
                .events
                .find_unprocessed(&params, last_id.as_deref(), last_timestamp, batch_size)
                .await?;

            if events.is_empty() {
                break;
            }
            let page_len = events.len();
            summary.total_events_found += page_len;
            summary.pages += 1;

            for event in &events {
                match self.publish_event(event, true).await {
                    Ok(()) => summary.total_events_published += 1,
                    Err(e) => error!(
                        event_id = %event.id,
                        error = %e,
                        "Failed to publish event for reprocessing"
                    ),
                }
            }

            // The cursor advances past failed publishes too; they are
            // picked up by the next run since they stay unprocessed.
            if let Some(last) = events.last() {
                last_id = Some(last.id.clone());
                last_timestamp = Some(last.timestamp);
            }

            info!(
                page = summary.pages,
                page_events = page_len,
                total_events_found = summary.total_events_found,
                total_events_published = summary.total_events_published,
                "Processed reprocessing page"
            );

            if page_len < batch_size {
                break;
            }
        }

        record_events_reprocessed(&params.tenant_id, summary.total_events_published);
        info!(
            pages = summary.pages,
            total_events_found = summary.total_events_found,
            total_events_published = summary.total_events_published,
            "Completed event reprocessing"
        );
        Ok(summary)
    }

    /// Starts the reprocessing workflow for one customer without waiting.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id))]
    pub async fn trigger_reprocess_events_workflow(
        &self,
        request: &ReprocessEventsRequest,
    ) -> Result<WorkflowRun, AppError> {
        validate_reprocess_request(request)?;

        let Some(executor) = self.workflow_executor.as_ref() else {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "workflow executor not configured"
            )));
        };

        let input = serde_json::json!({
            "tenant_id": request.tenant_id,
            "environment_id": request.environment_id,
            "external_customer_id": request.external_customer_id,
            "event_name": request.event_name,
            "start_date": request.start_time,
            "end_date": request.end_time,
            "batch_size": request.batch_size.unwrap_or(self.settings.reprocess_batch_size),
        });

        let run = executor
            .execute_workflow(REPROCESS_EVENTS_WORKFLOW, input)
            .await
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!(
                    "Failed to start reprocess events workflow: {}",
                    e
                ))
            })?;

        info!(
            workflow_id = %run.workflow_id,
            run_id = %run.run_id,
            external_customer_id = %request.external_customer_id,
            "Reprocess events workflow started"
        );
        Ok(run)
    }

    // =========================================================================
    // Benchmarking
    // =========================================================================

    /// Times one strategy for `event` without persisting anything. Failures
    /// are reported in the result.
    pub async fn benchmark_prepare(
        &self,
        strategy: TrackingStrategy,
        event: &Event,
    ) -> BenchmarkResult {
        let attributor = match strategy {
            TrackingStrategy::V1 => self.broad_scan.as_ref(),
            TrackingStrategy::V2 => self.targeted.as_ref(),
        };

        let started = Instant::now();
        let outcome = attributor.attribute(event).await;
        let duration_ms = started.elapsed().as_micros() as f64 / 1000.0;

        let (feature_usage_count, error) = match outcome {
            Ok(records) => (records.len(), None),
            Err(e) => (0, Some(e.to_string())),
        };

        BenchmarkResult {
            version: strategy.to_string(),
            event_id: event.id.clone(),
            duration_ms,
            feature_usage_count,
            error,
        }
    }

    async fn prepare(
        &self,
        attributor: &dyn UsageAttributor,
        event: &Event,
    ) -> Result<Vec<FeatureUsage>, AppError> {
        let started = Instant::now();
        let result = attributor.attribute(event).await;
        record_attribution_duration(
            attributor.strategy().as_str(),
            started.elapsed().as_secs_f64(),
        );
        result
    }
}

/// `tenant` or `tenant:external_customer_id`, keeping a customer's events on
/// one partition.
pub fn partition_key(event: &Event) -> String {
    if event.external_customer_id.is_empty() {
        event.tenant_id.clone()
    } else {
        format!("{}:{}", event.tenant_id, event.external_customer_id)
    }
}

fn validate_reprocess_request(request: &ReprocessEventsRequest) -> Result<(), AppError> {
    if request.tenant_id.is_empty() || request.environment_id.is_empty() {
        return Err(AppError::ValidationError(
            "tenant_id and environment_id are required".to_string(),
        ));
    }
    if request.external_customer_id.is_empty() {
        return Err(AppError::ValidationError(
            "external_customer_id is required".to_string(),
        ));
    }
    if let (Some(start), Some(end)) = (request.start_time, request.end_time) {
        if start > end {
            return Err(AppError::ValidationError(
                "start_time must be before end_time".to_string(),
            ));
        }
    }
    if request.batch_size == Some(0) {
        return Err(AppError::ValidationError(
            "batch_size must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(external_customer_id: &str) -> Event {
        Event {
            id: "evt_1".into(),
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            event_name: "api_call".into(),
            external_customer_id: external_customer_id.into(),
            customer_id: String::new(),
            timestamp: Utc::now(),
            source: String::new(),
            properties: HashMap::new(),
        }
    }

    #[test]
    fn partition_key_includes_customer_when_known() {
        assert_eq!(partition_key(&event("cust_ext")), "tenant:cust_ext");
        assert_eq!(partition_key(&event("")), "tenant");
    }

    #[test]
    fn reprocess_request_requires_customer_and_ordered_range() {
        let mut request = ReprocessEventsRequest {
            tenant_id: "tenant".into(),
            environment_id: "env".into(),
            ..Default::default()
        };
        assert!(validate_reprocess_request(&request).is_err());

        request.external_customer_id = "cust_ext".into();
        assert!(validate_reprocess_request(&request).is_ok());

        let now = Utc::now();
        request.start_time = Some(now);
        request.end_time = Some(now - chrono::Duration::hours(1));
        assert!(matches!(
            validate_reprocess_request(&request),
            Err(AppError::ValidationError(_))
        ));
    }
}
