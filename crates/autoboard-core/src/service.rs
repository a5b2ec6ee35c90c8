use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    activity::ActivityLog,
    event::AutoModeEvent,
    gateway::{ExecutionGateway, FeaturePersistence, GatewayAck, PlanDecision},
    persist::{self, AutoModeSnapshot, PersistedProject},
    scheduler::{AutoModeScheduler, PassReport, SchedulerConfig},
    session::{ProjectSession, ProjectState},
    types::{BoardEvent, Feature, FeaturePatch, PlanSpec, PlanStatus, Project, ProjectId},
    worktree::WorktreeRegistry,
};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub scheduler: SchedulerConfig,
    pub max_activity_entries: usize,
    pub max_progress_chars: usize,
    /// Where auto-mode flags are persisted. None disables persistence.
    pub state_path: Option<PathBuf>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            max_activity_entries: crate::activity::DEFAULT_MAX_ENTRIES,
            max_progress_chars: crate::activity::DEFAULT_MAX_PROGRESS_CHARS,
            state_path: None,
        }
    }
}

struct LoopHandle {
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    fn is_active(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.task.is_finished()
    }

    fn cancel(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

struct ProjectEntry {
    session: Arc<ProjectSession>,
    scheduler: Arc<AutoModeScheduler>,
    inbox: mpsc::UnboundedSender<AutoModeEvent>,
    run_loop: Option<LoopHandle>,
}

/// Owns every open project: one session, one event inbox and at most one
/// control loop per project. The gateway's single event subscription is
/// demultiplexed here so task state never bleeds between projects.
pub struct AutoModeService {
    options: ServiceOptions,
    registry: Arc<WorktreeRegistry>,
    gateway: Arc<dyn ExecutionGateway>,
    persistence: Arc<dyn FeaturePersistence>,
    projects: Mutex<HashMap<ProjectId, ProjectEntry>>,
    active_project: Mutex<Option<ProjectId>>,
    board_tx: broadcast::Sender<BoardEvent>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl AutoModeService {
    pub fn new(
        options: ServiceOptions,
        registry: Arc<WorktreeRegistry>,
        gateway: Arc<dyn ExecutionGateway>,
        persistence: Arc<dyn FeaturePersistence>,
    ) -> Arc<Self> {
        let (board_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            options,
            registry,
            gateway,
            persistence,
            projects: Mutex::new(HashMap::new()),
            active_project: Mutex::new(None),
            board_tx,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &Arc<WorktreeRegistry> {
        &self.registry
    }

    pub fn subscribe_board(&self) -> broadcast::Receiver<BoardEvent> {
        self.board_tx.subscribe()
    }

    // ── Projects ──────────────────────────────────────────────────────────

    /// Open a project (idempotent: an already-open project keeps its state).
    pub fn open_project(
        self: &Arc<Self>,
        project: Project,
        features: Vec<Feature>,
    ) -> Arc<ProjectSession> {
        let mut projects = self.lock_projects();
        if let Some(entry) = projects.get(&project.id) {
            return Arc::clone(&entry.session);
        }

        let activity = ActivityLog::new(
            self.options.max_activity_entries,
            self.options.max_progress_chars,
        );
        let state = ProjectState::new(self.options.scheduler.max_concurrency, activity)
            .with_features(features);
        let session = Arc::new(ProjectSession::new(project.clone(), state));
        let scheduler = Arc::new(AutoModeScheduler::new(
            Arc::clone(&session),
            Arc::clone(&self.registry),
            Arc::clone(&self.gateway),
            Arc::clone(&self.persistence),
            self.options.scheduler.clone(),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel::<AutoModeEvent>();
        let weak = Arc::downgrade(self);
        let inbox_session = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let notices = inbox_session.apply_event(&event).await;
                let Some(service) = weak.upgrade() else { break };
                service.publish(inbox_session.id(), notices).await;
            }
        });

        info!(project = %project.id, path = %project.path, "project opened");
        projects.insert(
            project.id.clone(),
            ProjectEntry {
                session: Arc::clone(&session),
                scheduler,
                inbox: tx,
                run_loop: None,
            },
        );
        session
    }

    /// Forget a project. Its loop stops advancing; nothing is cancelled service-side.
    pub fn close_project(&self, project_id: &str) -> bool {
        let removed = self.lock_projects().remove(project_id);
        let Some(entry) = removed else {
            return false;
        };
        if let Some(handle) = &entry.run_loop {
            handle.cancel();
        }
        let mut active = self.active_project.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(project_id) {
            *active = None;
        }
        info!(project = project_id, "project closed");
        true
    }

    pub fn session(&self, project_id: &str) -> Option<Arc<ProjectSession>> {
        self.lock_projects()
            .get(project_id)
            .map(|e| Arc::clone(&e.session))
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.lock_projects().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_active_project(&self, project_id: Option<String>) {
        *self.active_project.lock().unwrap_or_else(|e| e.into_inner()) = project_id;
    }

    pub fn active_project(&self) -> Option<ProjectId> {
        self.active_project.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_loop_active(&self, project_id: &str) -> bool {
        self.lock_projects()
            .get(project_id)
            .and_then(|e| e.run_loop.as_ref())
            .is_some_and(LoopHandle::is_active)
    }

    // ── Event routing ─────────────────────────────────────────────────────

    /// Which project an event belongs to. An event that names a project must
    /// name an open one; an anonymous event falls back to the active project.
    pub fn resolve_project(&self, event: &AutoModeEvent) -> Option<ProjectId> {
        let projects = self.lock_projects();
        if let Some(id) = &event.project_id {
            return projects.contains_key(id).then(|| id.clone());
        }
        if let Some(path) = &event.project_path {
            return projects
                .values()
                .find(|e| e.session.path() == path)
                .map(|e| e.session.id().to_string());
        }
        drop(projects);
        self.active_project()
            .filter(|id| self.lock_projects().contains_key(id))
    }

    /// Deliver an event to its project's inbox. Returns false if dropped.
    pub fn route(&self, event: AutoModeEvent) -> bool {
        let Some(project_id) = self.resolve_project(&event) else {
            warn!(
                kind = event.kind_name(),
                project_id = event.project_id.as_deref().unwrap_or("-"),
                project_path = event.project_path.as_deref().unwrap_or("-"),
                "dropping unattributable auto-mode event"
            );
            return false;
        };
        let projects = self.lock_projects();
        match projects.get(&project_id) {
            Some(entry) => entry.inbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Pump the gateway's shared subscription into per-project inboxes.
    pub fn spawn_event_router(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.gateway.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(service) = weak.upgrade() else { break };
                        service.route(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event router lagged, {n} auto-mode events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!("event router stopped");
        })
    }

    async fn publish(&self, project_id: &str, notices: Vec<BoardEvent>) {
        for notice in notices {
            if let BoardEvent::AutoModeChanged { is_running, .. } = &notice {
                if *is_running {
                    self.ensure_loop(project_id);
                } else {
                    self.cancel_loop(project_id);
                }
                self.persist_quietly().await;
            }
            // An errored feature is back in backlog; it waits for the next tick.
            if matches!(notice, BoardEvent::FeatureCompleted { .. }) {
                self.kick(project_id);
            }
            let _ = self.board_tx.send(notice);
        }
    }

    // ── Auto mode ─────────────────────────────────────────────────────────

    pub async fn start_auto_mode(
        &self,
        project_id: &str,
        max_concurrency: Option<usize>,
    ) -> Result<()> {
        let session = self.require_session(project_id)?;
        let max = match max_concurrency {
            Some(n) => n.max(1),
            None => session.lock().await.auto_mode.max_concurrency,
        };

        let ack = self
            .gateway
            .start(session.path(), max)
            .await
            .with_context(|| format!("start auto mode for {project_id}"))?;
        if !ack.success {
            bail!(
                "execution service refused to start auto mode: {}",
                ack.error.unwrap_or_else(|| "no reason given".into())
            );
        }

        let branch = self.registry.active_scope(project_id).branch;
        let changed = {
            let mut state = session.lock().await;
            let changed = !state.auto_mode.is_running;
            state.auto_mode.is_running = true;
            state.auto_mode.max_concurrency = max;
            state.auto_mode.branch_name = branch;
            changed
        };
        info!(project = project_id, max_concurrency = max, "auto mode enabled");
        self.ensure_loop(project_id);
        self.persist_quietly().await;
        if changed {
            let _ = self.board_tx.send(BoardEvent::AutoModeChanged {
                project_id: project_id.to_string(),
                is_running: true,
            });
        }
        Ok(())
    }

    /// Stop promoting new work. Features already running are left alone and
    /// leave the running set only through their completion or error events.
    pub async fn stop_auto_mode(&self, project_id: &str) -> Result<()> {
        let session = self.require_session(project_id)?;
        let changed = {
            let mut state = session.lock().await;
            let changed = state.auto_mode.is_running;
            state.auto_mode.is_running = false;
            changed
        };
        self.cancel_loop(project_id);
        self.persist_quietly().await;
        if changed {
            info!(project = project_id, "auto mode disabled");
            let _ = self.board_tx.send(BoardEvent::AutoModeChanged {
                project_id: project_id.to_string(),
                is_running: false,
            });
        }

        let ack = self
            .gateway
            .stop(session.path())
            .await
            .with_context(|| format!("stop auto mode for {project_id}"))?;
        if !ack.success {
            bail!(
                "execution service failed to stop auto mode: {}",
                ack.error.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Re-enable projects that were running when the previous process exited.
    /// A project the gateway refuses is demoted to stopped, not retried.
    pub async fn restore(self: &Arc<Self>) -> Result<usize> {
        let Some(path) = &self.options.state_path else {
            return Ok(0);
        };
        let snapshot = persist::load(path)?;
        let mut restored = 0;
        for (project_id, saved) in snapshot.projects {
            let project = Project::new(project_id.clone(), saved.path.clone());
            let session = self.open_project(project, Vec::new());
            {
                let mut state = session.lock().await;
                state.auto_mode.max_concurrency = saved.max_concurrency.max(1);
                state.auto_mode.branch_name = saved.branch_name.clone();
            }
            if !saved.is_running {
                continue;
            }
            let max = saved.max_concurrency.max(1);
            let accepted = match self.gateway.start(&saved.path, max).await {
                Ok(ack) if ack.success => true,
                Ok(ack) => {
                    let reason = ack.error.unwrap_or_default();
                    warn!(project = %project_id, "restore rejected: {reason}");
                    false
                }
                Err(e) => {
                    warn!(project = %project_id, "restore failed: {e:#}");
                    false
                }
            };
            session.lock().await.auto_mode.is_running = accepted;
            if accepted {
                info!(project = %project_id, "auto mode restored");
                self.ensure_loop(&project_id);
                restored += 1;
            }
        }
        self.persist().await?;
        Ok(restored)
    }

    /// Run one scheduling pass right away (e.g. a slot was freed). Skipped if
    /// the loop is mid-pass.
    pub async fn tick_now(&self, project_id: &str) -> Result<PassReport> {
        let (scheduler, alive) = {
            let projects = self.lock_projects();
            let entry = projects
                .get(project_id)
                .ok_or_else(|| anyhow!("unknown project {project_id}"))?;
            let alive = entry
                .run_loop
                .as_ref()
                .map(|h| Arc::clone(&h.alive))
                .unwrap_or_else(|| Arc::new(AtomicBool::new(true)));
            (Arc::clone(&entry.scheduler), alive)
        };
        Ok(scheduler.run_pass(&alive).await)
    }

    fn ensure_loop(&self, project_id: &str) {
        let mut projects = self.lock_projects();
        let Some(entry) = projects.get_mut(project_id) else {
            return;
        };
        if entry.run_loop.as_ref().is_some_and(LoopHandle::is_active) {
            return;
        }
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(Arc::clone(&entry.scheduler).run(Arc::clone(&alive)));
        entry.run_loop = Some(LoopHandle { alive, task });
    }

    /// A slot was freed: run a pass now instead of waiting for the next tick.
    fn kick(&self, project_id: &str) {
        let projects = self.lock_projects();
        let Some(entry) = projects.get(project_id) else {
            return;
        };
        let Some(handle) = entry.run_loop.as_ref().filter(|h| h.is_active()) else {
            return;
        };
        let scheduler = Arc::clone(&entry.scheduler);
        let alive = Arc::clone(&handle.alive);
        tokio::spawn(async move {
            scheduler.run_pass(&alive).await;
        });
    }

    fn cancel_loop(&self, project_id: &str) {
        let mut projects = self.lock_projects();
        if let Some(handle) = projects.get_mut(project_id).and_then(|e| e.run_loop.take()) {
            handle.cancel();
        }
    }

    // ── Feature controls ──────────────────────────────────────────────────

    pub async fn stop_feature(&self, project_id: &str, feature_id: &str) -> Result<GatewayAck> {
        self.require_session(project_id)?;
        self.gateway
            .stop_feature(feature_id)
            .await
            .with_context(|| format!("stop feature {feature_id}"))
    }

    pub async fn resume_feature(&self, project_id: &str, feature_id: &str) -> Result<GatewayAck> {
        let session = self.require_session(project_id)?;
        self.gateway
            .resume_feature(session.path(), feature_id)
            .await
            .with_context(|| format!("resume feature {feature_id}"))
    }

    pub async fn follow_up_feature(
        &self,
        project_id: &str,
        feature_id: &str,
        prompt: &str,
    ) -> Result<GatewayAck> {
        let session = self.require_session(project_id)?;
        self.gateway
            .follow_up_feature(session.path(), feature_id, prompt)
            .await
            .with_context(|| format!("follow up feature {feature_id}"))
    }

    /// Optimistically record the decision, then forward it. The intent is
    /// rolled back if the service does not accept it.
    pub async fn approve_plan(
        &self,
        project_id: &str,
        feature_id: &str,
        decision: PlanDecision,
    ) -> Result<GatewayAck> {
        let session = self.require_session(project_id)?;
        {
            let mut state = session.lock().await;
            let current = state
                .features
                .get(feature_id)
                .ok_or_else(|| anyhow!("unknown feature {feature_id}"))?;
            let previous = current.plan_spec.unwrap_or(PlanSpec {
                status: PlanStatus::Pending,
                content: String::new(),
                version: 1,
            });
            let plan = PlanSpec {
                status: if decision.approved {
                    PlanStatus::Approved
                } else {
                    PlanStatus::Rejected
                },
                content: decision.edited_plan.clone().unwrap_or(previous.content),
                version: previous.version,
            };
            state.features.apply_intent(
                feature_id,
                FeaturePatch {
                    plan_spec: Some(Some(plan)),
                    ..Default::default()
                },
            );
        }

        let result = self.gateway.approve_plan(session.path(), feature_id, &decision).await;
        let accepted = matches!(&result, Ok(ack) if ack.success);
        if !accepted {
            session.lock().await.features.clear_intent(feature_id);
        }
        result.with_context(|| format!("approve plan for {feature_id}"))
    }

    // ── Persistence ───────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> AutoModeSnapshot {
        let sessions: Vec<Arc<ProjectSession>> = self
            .lock_projects()
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        let mut snapshot = AutoModeSnapshot::default();
        for session in sessions {
            let auto = session.auto_mode().await;
            snapshot.projects.insert(
                session.id().to_string(),
                PersistedProject {
                    path: session.path().to_string(),
                    is_running: auto.is_running,
                    max_concurrency: auto.max_concurrency,
                    branch_name: auto.branch_name,
                },
            );
        }
        snapshot
    }

    /// Merge open projects into the state file, keeping entries for projects
    /// that are not open in this process.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.options.state_path else {
            return Ok(());
        };
        let _write = self.persist_lock.lock().await;
        let mut on_disk = match persist::load(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let kept = persist::set_aside(path)?;
                warn!("unreadable auto-mode state moved to {}: {e:#}", kept.display());
                AutoModeSnapshot::default()
            }
        };
        on_disk.projects.extend(self.snapshot().await.projects);
        persist::save(path, &on_disk)
    }

    async fn persist_quietly(&self) {
        if let Err(e) = self.persist().await {
            error!("persist auto-mode state: {e:#}");
        }
    }

    fn require_session(&self, project_id: &str) -> Result<Arc<ProjectSession>> {
        self.session(project_id)
            .ok_or_else(|| anyhow!("unknown project {project_id}"))
    }

    fn lock_projects(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, ProjectEntry>> {
        self.projects.lock().unwrap_or_else(|e| e.into_inner())
    }
}
