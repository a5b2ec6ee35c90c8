//! The auto-mode control loop.
//!
//! One loop per enabled project. Each pass fills free concurrency slots with
//! eligible backlog features, in priority order. A slot is reserved as pending
//! before the start request goes out, so an event that settles the feature
//! while the request is in flight clears it for good.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    deps,
    gateway::{ExecutionGateway, FeaturePersistence},
    session::ProjectSession,
    types::{ActiveScope, Feature, FeatureId, FeaturePatch, FeatureStatus},
    worktree::WorktreeRegistry,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3_000);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Budget used when a project does not set its own.
    pub max_concurrency: usize,
    pub enable_dependency_blocking: bool,
    /// Skip features whose plan is waiting on a human.
    pub require_plan_approval: bool,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            enable_dependency_blocking: true,
            require_plan_approval: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What a single pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Another pass held the guard.
    pub skipped: bool,
    pub started: Vec<FeatureId>,
    pub failed: Vec<FeatureId>,
    /// Liveness or `is_running` dropped mid-batch.
    pub aborted: bool,
}

// ── Candidate selection ──────────────────────────────────────────────────

/// Branch-scope rule for a single feature.
pub fn branch_matches(
    feature: &Feature,
    scope: &ActiveScope,
    is_primary_branch: impl Fn(&str) -> bool,
) -> bool {
    match (&feature.branch_name, &scope.branch) {
        (None, _) => scope.is_primary(),
        // Worktree info still loading: only trust a confirmed primary branch.
        (Some(branch), None) => is_primary_branch(branch),
        (Some(branch), Some(active)) => branch == active,
    }
}

/// Eligible backlog features in start order: scope filter, stable priority
/// sort (missing priority last), then the dependency gate. No slot limit.
pub fn select_candidates(
    features: &[Feature],
    scope: &ActiveScope,
    is_primary_branch: impl Fn(&str) -> bool,
    busy: &BTreeSet<FeatureId>,
    config: &SchedulerConfig,
) -> Vec<Feature> {
    let mut eligible: Vec<&Feature> = features
        .iter()
        .filter(|f| f.status == FeatureStatus::Backlog)
        .filter(|f| !busy.contains(&f.id))
        .filter(|f| !(config.require_plan_approval && f.awaiting_plan_approval()))
        .filter(|f| branch_matches(f, scope, &is_primary_branch))
        .collect();
    // sort_by_key is stable, so equal priorities keep store order.
    eligible.sort_by_key(|f| (f.priority.is_none(), f.priority.unwrap_or_default()));
    eligible
        .into_iter()
        .filter(|f| !deps::is_blocked(f, features, config.enable_dependency_blocking))
        .cloned()
        .collect()
}

// ── Reentrancy guard ─────────────────────────────────────────────────────

struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

pub struct AutoModeScheduler {
    session: Arc<ProjectSession>,
    registry: Arc<WorktreeRegistry>,
    gateway: Arc<dyn ExecutionGateway>,
    persistence: Arc<dyn FeaturePersistence>,
    config: SchedulerConfig,
    in_pass: AtomicBool,
}

impl AutoModeScheduler {
    pub fn new(
        session: Arc<ProjectSession>,
        registry: Arc<WorktreeRegistry>,
        gateway: Arc<dyn ExecutionGateway>,
        persistence: Arc<dyn FeaturePersistence>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            session,
            registry,
            gateway,
            persistence,
            config,
            in_pass: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<ProjectSession> {
        &self.session
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Tick until `alive` is cleared or auto mode is switched off.
    pub async fn run(self: Arc<Self>, alive: Arc<AtomicBool>) {
        let project = self.session.id().to_string();
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            project = %project,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "auto-mode loop started"
        );
        loop {
            interval.tick().await;
            if !alive.load(Ordering::Acquire) || !self.session.is_running().await {
                break;
            }
            let report = self.run_pass(&alive).await;
            if !report.started.is_empty() || !report.failed.is_empty() {
                debug!(
                    project = %project,
                    started = ?report.started,
                    failed = ?report.failed,
                    "pass done"
                );
            }
        }
        info!(project = %project, "auto-mode loop exited");
    }

    /// One check-and-start pass. Overlapping calls return `skipped`.
    pub async fn run_pass(&self, alive: &AtomicBool) -> PassReport {
        let mut report = PassReport::default();
        let Some(_guard) = PassGuard::try_enter(&self.in_pass) else {
            debug!(project = self.session.id(), "pass already in progress, skipping tick");
            report.skipped = true;
            return report;
        };

        let project_id = self.session.id().to_string();
        let scope = self.registry.active_scope(&project_id);

        let batch = {
            let state = self.session.lock().await;
            if !alive.load(Ordering::Acquire) || !state.auto_mode.is_running {
                report.aborted = true;
                return report;
            }
            let available = state.available_slots();
            if available == 0 {
                return report;
            }
            let features = state.features.list();
            let busy = state.busy_ids();
            let registry = &self.registry;
            let candidates = select_candidates(
                &features,
                &scope,
                |b| registry.is_primary_branch(&project_id, b),
                &busy,
                &self.config,
            );
            candidates.into_iter().take(available).collect::<Vec<_>>()
        };

        for feature in batch {
            if !alive.load(Ordering::Acquire) {
                info!(project = %project_id, "auto-mode loop cancelled mid-batch");
                report.aborted = true;
                break;
            }
            {
                let mut state = self.session.lock().await;
                if !state.auto_mode.is_running {
                    info!(project = %project_id, "auto mode switched off mid-batch");
                    report.aborted = true;
                    break;
                }
                if state.available_slots() == 0 {
                    break;
                }
                let still_backlog = state
                    .features
                    .get(&feature.id)
                    .is_some_and(|f| f.status == FeatureStatus::Backlog);
                if !still_backlog || !state.reserve(&feature.id) {
                    continue;
                }
            }

            let started = match self.start_one(&feature, &scope).await {
                Ok(started) => started,
                Err(e) => {
                    warn!(project = %project_id, feature_id = %feature.id, "start failed: {e:#}");
                    false
                }
            };
            if started {
                report.started.push(feature.id.clone());
            } else {
                self.session.lock().await.release(&feature.id);
                report.failed.push(feature.id.clone());
            }
        }
        report
    }

    /// Adopt the branch if needed, then ask the gateway to run the feature.
    /// The caller has already reserved the slot. `Ok(false)` means the gateway
    /// declined; the feature stays in backlog.
    async fn start_one(&self, feature: &Feature, scope: &ActiveScope) -> Result<bool> {
        let path = self.session.path();
        let branch = match (&feature.branch_name, scope.is_primary(), &scope.branch) {
            (Some(b), _, _) => Some(b.clone()),
            (None, true, Some(primary)) => {
                self.adopt_branch(feature, primary).await?;
                Some(primary.clone())
            }
            (None, _, _) => None,
        };

        let ack = self
            .gateway
            .start_feature(path, &feature.id, branch.as_deref())
            .await
            .with_context(|| format!("start_feature {}", feature.id))?;
        if !ack.success {
            warn!(
                project = self.session.id(),
                feature_id = %feature.id,
                "gateway declined start: {}",
                ack.error.as_deref().unwrap_or("no reason given")
            );
            return Ok(false);
        }

        info!(
            project = self.session.id(),
            feature_id = %feature.id,
            branch = branch.as_deref().unwrap_or("-"),
            "feature start requested"
        );
        Ok(true)
    }

    /// Persist the primary branch onto an unassigned feature before it runs.
    async fn adopt_branch(&self, feature: &Feature, branch: &str) -> Result<()> {
        let patch = FeaturePatch::branch(branch);
        self.persistence
            .update(self.session.path(), &feature.id, &patch)
            .await
            .with_context(|| format!("assign branch {branch} to {}", feature.id))?;
        self.session.lock().await.features.update(&feature.id, &patch);
        debug!(
            project = self.session.id(),
            feature_id = %feature.id,
            branch,
            "adopted unassigned feature"
        );
        Ok(())
    }
}
