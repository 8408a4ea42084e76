//! Usage Service entry point.

use usage_service::config::UsageConfig;
use usage_service::services::init_metrics;
use usage_service::startup::Application;

use service_core::observability::init_tracing;
use tokio::signal;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load configuration
    let config = UsageConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    // Initialize tracing
    init_tracing(
        &config.identity.name,
        &config.identity.log_level,
        config.identity.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = %config.identity.version,
        otlp_endpoint = ?config.identity.otlp_endpoint,
        "Starting usage-service"
    );

    // Initialize metrics
    init_metrics();

    // Log configuration (mask sensitive values)
    tracing::info!(
        service_name = %config.identity.name,
        http_port = %config.common.port,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        events_topic = %config.pubsub.events_topic,
        backfill_topic = %config.pubsub.backfill_topic,
        consumer_enabled = %config.pubsub.consumer_enabled,
        tracking_strategy = %config.tracking.strategy,
        workflow_executor = ?config.workflow.executor_url,
        "Configuration loaded"
    );

    // Build and run application
    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    let shutdown = app.shutdown_token();
    let run = app.run_until_stopped();
    tokio::pin!(run);

    // Run with graceful shutdown
    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Application error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
            shutdown.cancel();
            run.await?;
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}
