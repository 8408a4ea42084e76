//! Customer onboarding workflow payloads exchanged with the workflow executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

pub const CUSTOMER_ONBOARDING_WORKFLOW: &str = "CustomerOnboardingWorkflow";
pub const REPROCESS_EVENTS_WORKFLOW: &str = "ReprocessEventsWorkflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    CreateCustomer,
    CreateSubscription,
    CreateWallet,
    CreateFeatureAndPrice,
    RolloutToSubscriptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

/// One configured onboarding step. Action-specific settings are kept opaque;
/// only the executor interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActionConfig {
    pub action: WorkflowAction,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowActionConfig {
    pub fn new(action: WorkflowAction) -> Self {
        Self {
            action,
            params: serde_json::Map::new(),
        }
    }
}

/// Per-environment onboarding setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_type")]
    pub workflow_type: String,
    #[serde(default)]
    pub actions: Vec<WorkflowActionConfig>,
}

fn default_workflow_type() -> String {
    "customer_onboarding".to_string()
}

impl WorkflowConfig {
    pub fn new(actions: Vec<WorkflowActionConfig>) -> Self {
        Self {
            workflow_type: default_workflow_type(),
            actions,
        }
    }

    /// Auto-provisioning only runs when customer creation is the first step.
    pub fn starts_with_create_customer(&self) -> bool {
        self.actions
            .first()
            .is_some_and(|a| a.action == WorkflowAction::CreateCustomer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerOnboardingInput {
    pub external_customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
    pub tenant_id: String,
    pub environment_id: String,
    pub workflow_config: WorkflowConfig,
}

impl CustomerOnboardingInput {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.external_customer_id.is_empty() {
            return Err(AppError::ValidationError(
                "external_customer_id is required".to_string(),
            ));
        }
        if self.tenant_id.is_empty() {
            return Err(AppError::ValidationError("tenant_id is required".to_string()));
        }
        if self.environment_id.is_empty() {
            return Err(AppError::ValidationError(
                "environment_id is required".to_string(),
            ));
        }
        if self.workflow_config.actions.is_empty() {
            return Err(AppError::ValidationError(
                "workflow_config must have at least one action".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingActionResult {
    pub action_type: WorkflowAction,
    #[serde(default)]
    pub action_index: usize,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerOnboardingResult {
    #[serde(default)]
    pub customer_id: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub actions_executed: usize,
    #[serde(default)]
    pub results: Vec<OnboardingActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

impl CustomerOnboardingResult {
    /// Id of the customer created by a completed `create_customer` step.
    pub fn created_customer_id(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| {
                r.action_type == WorkflowAction::CreateCustomer
                    && r.status == WorkflowStatus::Completed
                    && !r.resource_id.is_empty()
            })
            .map(|r| r.resource_id.as_str())
    }
}
