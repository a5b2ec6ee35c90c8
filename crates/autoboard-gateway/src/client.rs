use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use autoboard_core::{
    event::AutoModeEvent,
    gateway::{ExecutionGateway, FeaturePersistence, GatewayAck, PlanDecision},
    FeaturePatch,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Talks to the automation backend over its JSON HTTP API.
///
/// Every control call returns the backend's `{ success, error }` body. A
/// non-2xx status is turned into a failed ack; only transport errors are `Err`.
/// Events are delivered through [`crate::spawn_event_stream`], which feeds the
/// channel handed out by `subscribe`.
pub struct HttpGateway {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
    tx: broadcast::Sender<AutoModeEvent>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("build http client")?;
        let (tx, _) = broadcast::channel(1024);
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
            tx,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<AutoModeEvent> {
        self.tx.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body and read back an ack. `timeout: None` waits as long as
    /// the backend takes.
    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<GatewayAck> {
        let url = self.url(path);
        let mut req = self.http.post(&url).json(body);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let response = req.send().await.with_context(|| format!("POST {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, path, "backend returned non-2xx: {}", text);
            return Ok(GatewayAck::failed(format!("HTTP {status}: {text}")));
        }
        let ack: GatewayAck = response
            .json()
            .await
            .with_context(|| format!("decode ack from {url}"))?;
        debug!(path, success = ack.success, "backend call done");
        Ok(ack)
    }
}

#[async_trait]
impl ExecutionGateway for HttpGateway {
    async fn start(&self, project_path: &str, max_concurrency: usize) -> Result<GatewayAck> {
        let body = json!({ "projectPath": project_path, "maxConcurrency": max_concurrency });
        self.post("/api/auto-mode/start", &body, Some(self.timeout)).await
    }

    async fn stop(&self, project_path: &str) -> Result<GatewayAck> {
        let body = json!({ "projectPath": project_path });
        self.post("/api/auto-mode/stop", &body, Some(self.timeout)).await
    }

    async fn start_feature(
        &self,
        project_path: &str,
        feature_id: &str,
        branch: Option<&str>,
    ) -> Result<GatewayAck> {
        let body = json!({
            "projectPath": project_path,
            "featureId": feature_id,
            "branchName": branch,
        });
        self.post("/api/auto-mode/run-feature", &body, None).await
    }

    async fn stop_feature(&self, feature_id: &str) -> Result<GatewayAck> {
        let body = json!({ "featureId": feature_id });
        self.post("/api/auto-mode/stop-feature", &body, Some(self.timeout)).await
    }

    async fn resume_feature(&self, project_path: &str, feature_id: &str) -> Result<GatewayAck> {
        let body = json!({ "projectPath": project_path, "featureId": feature_id });
        self.post("/api/auto-mode/resume-feature", &body, Some(self.timeout)).await
    }

    async fn follow_up_feature(
        &self,
        project_path: &str,
        feature_id: &str,
        prompt: &str,
    ) -> Result<GatewayAck> {
        let body = json!({
            "projectPath": project_path,
            "featureId": feature_id,
            "prompt": prompt,
        });
        self.post("/api/auto-mode/follow-up-feature", &body, Some(self.timeout)).await
    }

    async fn approve_plan(
        &self,
        project_path: &str,
        feature_id: &str,
        decision: &PlanDecision,
    ) -> Result<GatewayAck> {
        let body = json!({
            "projectPath": project_path,
            "featureId": feature_id,
            "approved": decision.approved,
            "editedPlan": decision.edited_plan,
            "feedback": decision.feedback,
        });
        self.post("/api/auto-mode/approve-plan", &body, Some(self.timeout)).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AutoModeEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl FeaturePersistence for HttpGateway {
    async fn update(
        &self,
        project_path: &str,
        feature_id: &str,
        patch: &FeaturePatch,
    ) -> Result<()> {
        let body = json!({
            "projectPath": project_path,
            "featureId": feature_id,
            "updates": patch,
        });
        let ack = self.post("/api/features/update", &body, Some(self.timeout)).await?;
        if !ack.success {
            bail!(
                "feature update rejected for {feature_id}: {}",
                ack.error.unwrap_or_else(|| "no reason given".into())
            );
        }
        Ok(())
    }
}
