//! Workflow executor client used for customer auto-provisioning and bulk
//! reprocessing.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::observability::inject_trace_context;
use std::time::Duration;
use tracing::{info, instrument};

use crate::models::WorkflowRun;

#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Runs a workflow to completion and returns its JSON result. Exceeding
    /// `timeout` is an error.
    async fn execute_workflow_sync(
        &self,
        name: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, AppError>;

    /// Starts a workflow without waiting for it.
    async fn execute_workflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowRun, AppError>;
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    workflow: &'a str,
    input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    result: serde_json::Value,
}

/// JSON-over-HTTP workflow executor.
///
/// `POST {base_url}/workflows/execute` waits for the result;
/// `POST {base_url}/workflows/start` returns the run handle.
pub struct HttpWorkflowExecutor {
    base_url: String,
    client: Client,
}

impl HttpWorkflowExecutor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn trace_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        headers
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &ExecuteRequest<'_>,
        timeout: Option<Duration>,
    ) -> Result<T, AppError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .headers(Self::trace_headers())
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            AppError::InternalError(anyhow::anyhow!(
                "Failed to call workflow executor for {}: {}",
                body.workflow,
                e
            ))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Workflow {} returned error status {}: {}",
                body.workflow,
                status,
                text
            )));
        }

        response.json::<T>().await.map_err(|e| {
            AppError::InternalError(anyhow::anyhow!(
                "Failed to parse workflow {} response: {}",
                body.workflow,
                e
            ))
        })
    }
}

#[async_trait]
impl WorkflowExecutor for HttpWorkflowExecutor {
    #[instrument(skip(self, input), fields(workflow = %name))]
    async fn execute_workflow_sync(
        &self,
        name: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, AppError> {
        let body = ExecuteRequest {
            workflow: name,
            input,
            timeout_seconds: Some(timeout.as_secs()),
        };
        let response: ExecuteResponse = self.post("/workflows/execute", &body, Some(timeout)).await?;
        info!("Workflow completed");
        Ok(response.result)
    }

    #[instrument(skip(self, input), fields(workflow = %name))]
    async fn execute_workflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<WorkflowRun, AppError> {
        let body = ExecuteRequest {
            workflow: name,
            input,
            timeout_seconds: None,
        };
        let run: WorkflowRun = self.post("/workflows/start", &body, None).await?;
        info!(workflow_id = %run.workflow_id, run_id = %run.run_id, "Workflow started");
        Ok(run)
    }
}
