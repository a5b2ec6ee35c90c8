#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use autoboard_core::{
    activity::ActivityLog,
    event::{AutoModeEvent, EventKind},
    gateway::{ExecutionGateway, FeaturePersistence, GatewayAck, PlanDecision},
    scheduler::{AutoModeScheduler, SchedulerConfig},
    session::{ProjectSession, ProjectState},
    worktree::WorktreeRegistry,
    Feature, FeaturePatch, Project, WorktreeDescriptor,
};
use tokio::sync::broadcast;

// ── Recording gateway ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StartCall {
    pub project_path: String,
    pub feature_id: String,
    pub branch: Option<String>,
}

pub struct FakeGateway {
    pub starts: Mutex<Vec<StartCall>>,
    pub auto_starts: Mutex<Vec<(String, usize)>>,
    pub stops: Mutex<Vec<String>>,
    pub stopped_features: Mutex<Vec<String>>,
    pub plan_calls: Mutex<Vec<(String, PlanDecision)>>,
    /// Feature ids whose start is declined.
    pub decline: Mutex<HashSet<String>>,
    pub refuse_auto_start: AtomicBool,
    pub refuse_plans: AtomicBool,
    /// Switched off inside the first `start_feature` call.
    pub switch_off_on_start: Mutex<Option<Arc<ProjectSession>>>,
    pub start_delay: Mutex<Option<Duration>>,
    /// Accept every start, then report it failed for `PROJECT`.
    pub fail_after_start: AtomicBool,
    tx: broadcast::Sender<AutoModeEvent>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            auto_starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            stopped_features: Mutex::new(Vec::new()),
            plan_calls: Mutex::new(Vec::new()),
            decline: Mutex::new(HashSet::new()),
            refuse_auto_start: AtomicBool::new(false),
            refuse_plans: AtomicBool::new(false),
            switch_off_on_start: Mutex::new(None),
            start_delay: Mutex::new(None),
            fail_after_start: AtomicBool::new(false),
            tx,
        })
    }

    pub fn started_ids(&self) -> Vec<String> {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.feature_id.clone())
            .collect()
    }

    pub fn decline(&self, feature_id: &str) {
        self.decline.lock().unwrap().insert(feature_id.to_string());
    }

    /// Push an event as if it came from the execution service.
    pub fn emit(&self, event: AutoModeEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl ExecutionGateway for FakeGateway {
    async fn start(&self, project_path: &str, max_concurrency: usize) -> Result<GatewayAck> {
        self.auto_starts
            .lock()
            .unwrap()
            .push((project_path.to_string(), max_concurrency));
        if self.refuse_auto_start.load(Ordering::SeqCst) {
            return Ok(GatewayAck::failed("project not found"));
        }
        Ok(GatewayAck::ok())
    }

    async fn stop(&self, project_path: &str) -> Result<GatewayAck> {
        self.stops.lock().unwrap().push(project_path.to_string());
        Ok(GatewayAck::ok())
    }

    async fn start_feature(
        &self,
        project_path: &str,
        feature_id: &str,
        branch: Option<&str>,
    ) -> Result<GatewayAck> {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.starts.lock().unwrap().push(StartCall {
            project_path: project_path.to_string(),
            feature_id: feature_id.to_string(),
            branch: branch.map(str::to_string),
        });
        let switch_off = self.switch_off_on_start.lock().unwrap().take();
        if let Some(session) = switch_off {
            session.lock().await.auto_mode.is_running = false;
        }
        if self.decline.lock().unwrap().contains(feature_id) {
            return Ok(GatewayAck::failed("already running"));
        }
        if self.fail_after_start.load(Ordering::SeqCst) {
            self.emit(failed(feature_id, "invalid api key").for_project(PROJECT));
        }
        Ok(GatewayAck::ok())
    }

    async fn stop_feature(&self, feature_id: &str) -> Result<GatewayAck> {
        self.stopped_features
            .lock()
            .unwrap()
            .push(feature_id.to_string());
        Ok(GatewayAck::ok())
    }

    async fn resume_feature(&self, _project_path: &str, _feature_id: &str) -> Result<GatewayAck> {
        Ok(GatewayAck::ok())
    }

    async fn follow_up_feature(
        &self,
        _project_path: &str,
        _feature_id: &str,
        _prompt: &str,
    ) -> Result<GatewayAck> {
        Ok(GatewayAck::ok())
    }

    async fn approve_plan(
        &self,
        _project_path: &str,
        feature_id: &str,
        decision: &PlanDecision,
    ) -> Result<GatewayAck> {
        self.plan_calls
            .lock()
            .unwrap()
            .push((feature_id.to_string(), decision.clone()));
        if self.refuse_plans.load(Ordering::SeqCst) {
            return Ok(GatewayAck::failed("plan superseded"));
        }
        Ok(GatewayAck::ok())
    }

    fn subscribe(&self) -> broadcast::Receiver<AutoModeEvent> {
        self.tx.subscribe()
    }
}

// ── Recording persistence ────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePersistence {
    pub updates: Mutex<Vec<(String, FeaturePatch)>>,
    pub fail: AtomicBool,
}

impl FakePersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl FeaturePersistence for FakePersistence {
    async fn update(
        &self,
        _project_path: &str,
        feature_id: &str,
        patch: &FeaturePatch,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.updates
            .lock()
            .unwrap()
            .push((feature_id.to_string(), patch.clone()));
        Ok(())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

pub const PROJECT: &str = "p1";
pub const REPO: &str = "/repo";

pub fn registry_on_main() -> Arc<WorktreeRegistry> {
    let registry = Arc::new(WorktreeRegistry::new());
    registry.refresh(
        PROJECT,
        vec![
            WorktreeDescriptor {
                path: None,
                branch: "main".into(),
                is_main: true,
                has_changes: false,
            },
            WorktreeDescriptor {
                path: Some("/repo/.worktrees/feat-x".into()),
                branch: "feat-x".into(),
                is_main: false,
                has_changes: false,
            },
        ],
    );
    registry
}

pub struct Harness {
    pub session: Arc<ProjectSession>,
    pub scheduler: AutoModeScheduler,
    pub gateway: Arc<FakeGateway>,
    pub persistence: Arc<FakePersistence>,
    pub registry: Arc<WorktreeRegistry>,
    pub alive: AtomicBool,
}

/// A running scheduler for one project, driven pass by pass.
pub async fn harness(max_concurrency: usize, features: Vec<Feature>) -> Harness {
    harness_with(max_concurrency, features, SchedulerConfig::default()).await
}

pub async fn harness_with(
    max_concurrency: usize,
    features: Vec<Feature>,
    config: SchedulerConfig,
) -> Harness {
    let gateway = FakeGateway::new();
    let persistence = FakePersistence::new();
    let registry = registry_on_main();
    let state = ProjectState::new(max_concurrency, ActivityLog::default()).with_features(features);
    let session = Arc::new(ProjectSession::new(Project::new(PROJECT, REPO), state));
    session.lock().await.auto_mode.is_running = true;
    let scheduler = AutoModeScheduler::new(
        Arc::clone(&session),
        Arc::clone(&registry),
        gateway.clone(),
        persistence.clone(),
        config,
    );
    Harness {
        session,
        scheduler,
        gateway,
        persistence,
        registry,
        alive: AtomicBool::new(true),
    }
}

pub fn started(feature_id: &str) -> AutoModeEvent {
    AutoModeEvent::new(EventKind::FeatureStart {
        feature_id: feature_id.into(),
    })
}

pub fn completed(feature_id: &str, passes: bool) -> AutoModeEvent {
    AutoModeEvent::new(EventKind::FeatureComplete {
        feature_id: feature_id.into(),
        passes: Some(passes),
        message: None,
    })
}

pub fn failed(feature_id: &str, error: &str) -> AutoModeEvent {
    AutoModeEvent::new(EventKind::Error {
        feature_id: Some(feature_id.into()),
        error: error.into(),
        error_type: None,
    })
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
