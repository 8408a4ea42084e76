use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use futures::StreamExt;
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::UsageConfig;
use crate::services::attribution::AttributionContext;
use crate::services::pubsub::{PubSub, RedisPubSub};
use crate::services::repository::Repositories;
use crate::services::workflow::{HttpWorkflowExecutor, WorkflowExecutor};
use crate::services::{
    get_metrics, init_metrics, Database, DeliveryOutcome, FeatureUsageTrackingService,
    UsageAnalyticsService,
};

#[derive(Clone)]
pub struct HealthState {
    pub db: Database,
    pub pubsub: RedisPubSub,
}

async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let checks = async {
        state.db.health_check().await?;
        state.pubsub.health_check().await
    };

    match checks.await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "usage-service",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string()
            })),
        ),
    }
}

async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Drains one topic, handing each delivery to the tracking service, until
/// `shutdown` fires or the subscription ends.
pub async fn run_consumer(
    tracking: FeatureUsageTrackingService,
    pubsub: Arc<dyn PubSub>,
    topic: String,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let mut messages = pubsub.subscribe(&topic).await?;
    info!(topic = %topic, "Event consumer started");

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = messages.next() => match message {
                Some(message) => message,
                None => {
                    warn!(topic = %topic, "Subscription closed");
                    break;
                }
            },
        };

        if tracking.handle_delivery(&topic, message).await == DeliveryOutcome::Abandoned {
            warn!(topic = %topic, "Delivery abandoned");
        }
    }

    info!(topic = %topic, "Event consumer stopped");
    Ok(())
}

pub struct Application {
    http_port: u16,
    listener: TcpListener,
    state: HealthState,
    pubsub: Arc<dyn PubSub>,
    tracking: FeatureUsageTrackingService,
    analytics: UsageAnalyticsService,
    consumer_enabled: bool,
    shutdown: CancellationToken,
}

impl Application {
    pub async fn build(config: UsageConfig) -> Result<Self, std::io::Error> {
        Self::build_internal(config, true).await
    }

    pub async fn build_without_migrations(config: UsageConfig) -> Result<Self, std::io::Error> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: UsageConfig,
        run_migrations: bool,
    ) -> Result<Self, std::io::Error> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            std::io::Error::other(e.to_string())
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                error!("Failed to run migrations: {}", e);
                std::io::Error::other(e.to_string())
            })?;
        }

        let redis = RedisPubSub::new(&config.pubsub.redis_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to Redis: {}", e);
                std::io::Error::other(e.to_string())
            })?;

        let repos = Repositories::from_store(Arc::new(db.clone()));
        let mut context = AttributionContext::new(repos.clone())
            .with_onboarding_timeout(config.tracking.onboarding_timeout);
        match &config.workflow.executor_url {
            Some(url) => {
                info!(executor_url = %url, "Customer auto-provisioning enabled");
                let executor: Arc<dyn WorkflowExecutor> = Arc::new(HttpWorkflowExecutor::new(url));
                context = context.with_workflow_executor(executor);
            }
            None => info!("No workflow executor configured, auto-provisioning disabled"),
        }

        let pubsub: Arc<dyn PubSub> = Arc::new(redis.clone());
        let tracking =
            FeatureUsageTrackingService::new(context, pubsub.clone(), config.tracking_settings());
        let analytics = UsageAnalyticsService::new(repos);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await?;
        let http_port = listener.local_addr()?.port();

        info!(
            strategy = %config.tracking.strategy,
            port = http_port,
            "usage-service built"
        );

        Ok(Self {
            http_port,
            listener,
            state: HealthState { db, pubsub: redis },
            pubsub,
            tracking,
            analytics,
            consumer_enabled: config.pubsub.consumer_enabled,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn tracking(&self) -> &FeatureUsageTrackingService {
        &self.tracking
    }

    pub fn analytics(&self) -> &UsageAnalyticsService {
        &self.analytics
    }

    /// Cancelling this token stops the consumers and drains the HTTP server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let mut consumers = JoinSet::new();
        if self.consumer_enabled {
            for topic in self.tracking.topics() {
                consumers.spawn(run_consumer(
                    self.tracking.clone(),
                    self.pubsub.clone(),
                    topic.to_string(),
                    self.shutdown.clone(),
                ));
            }
        } else {
            info!("Event consumer disabled");
        }

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        info!("HTTP server listening on port {}", self.http_port);

        let shutdown = self.shutdown.clone();
        let server = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        let result = server.await;
        self.shutdown.cancel();

        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Event consumer failed: {}", e),
                Err(e) => error!("Event consumer task panicked: {}", e),
            }
        }
        self.tracking.drain_redeliveries().await;

        result
    }
}
