use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{event::AutoModeEvent, types::FeaturePatch};

/// Acknowledgement returned by every execution-service call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayAck {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl GatewayAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Human decision on a plan the agent is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDecision {
    pub approved: bool,
    #[serde(default)]
    pub edited_plan: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// The agent-execution service. Shared by every open project; events come
/// back through one subscription and carry the project they belong to.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Start the service-side auto loop for a project.
    async fn start(&self, project_path: &str, max_concurrency: usize) -> Result<GatewayAck>;

    async fn stop(&self, project_path: &str) -> Result<GatewayAck>;

    /// Ask the service to run one feature. Success means "accepted", not
    /// "running"; running is confirmed by a `feature_start` event.
    async fn start_feature(
        &self,
        project_path: &str,
        feature_id: &str,
        branch: Option<&str>,
    ) -> Result<GatewayAck>;

    async fn stop_feature(&self, feature_id: &str) -> Result<GatewayAck>;

    async fn resume_feature(&self, project_path: &str, feature_id: &str) -> Result<GatewayAck>;

    async fn follow_up_feature(
        &self,
        project_path: &str,
        feature_id: &str,
        prompt: &str,
    ) -> Result<GatewayAck>;

    async fn approve_plan(
        &self,
        project_path: &str,
        feature_id: &str,
        decision: &PlanDecision,
    ) -> Result<GatewayAck>;

    fn subscribe(&self) -> broadcast::Receiver<AutoModeEvent>;
}

/// Durable feature storage owned by the host application.
#[async_trait]
pub trait FeaturePersistence: Send + Sync {
    async fn update(&self, project_path: &str, feature_id: &str, patch: &FeaturePatch)
        -> Result<()>;
}
