use std::collections::BTreeSet;

use tokio::sync::{Mutex, MutexGuard};

use crate::{
    activity::ActivityLog,
    event::AutoModeEvent,
    reconciler,
    store::FeatureStore,
    types::{AutoModeState, BoardEvent, Feature, FeatureId, Project},
};

/// Everything the reconciler and scheduler share for one project.
pub struct ProjectState {
    pub features: FeatureStore,
    pub auto_mode: AutoModeState,
    /// Start requested or acknowledged, `feature_start` not seen yet. Only a
    /// start, complete or error event (or a refused request) removes an id.
    /// Never overlaps `auto_mode.running_task_ids`.
    pub pending: BTreeSet<FeatureId>,
    pub activity: ActivityLog,
}

impl ProjectState {
    pub fn new(max_concurrency: usize, activity: ActivityLog) -> Self {
        Self {
            features: FeatureStore::new(),
            auto_mode: AutoModeState {
                max_concurrency: max_concurrency.max(1),
                ..Default::default()
            },
            pending: BTreeSet::new(),
            activity,
        }
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features = FeatureStore::from_features(features);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.auto_mode.running_task_ids.len() + self.pending.len()
    }

    pub fn available_slots(&self) -> usize {
        self.auto_mode.max_concurrency.saturating_sub(self.in_flight())
    }

    /// Ids that must not be picked again: running or pending.
    pub fn busy_ids(&self) -> BTreeSet<FeatureId> {
        self.auto_mode
            .running_task_ids
            .union(&self.pending)
            .cloned()
            .collect()
    }

    /// Claim a slot for a start that is about to be requested. Returns false
    /// if the id is already running or pending.
    pub fn reserve(&mut self, feature_id: &str) -> bool {
        if self.auto_mode.running_task_ids.contains(feature_id) {
            return false;
        }
        self.pending.insert(feature_id.to_string())
    }

    /// Give back a slot whose start was declined or failed. An event that
    /// already settled the id has removed it, so this is then a no-op.
    pub fn release(&mut self, feature_id: &str) -> bool {
        self.pending.remove(feature_id)
    }
}

/// A project opened on the board. All access to its state goes through one
/// async mutex that is never held across a gateway or persistence await.
pub struct ProjectSession {
    pub project: Project,
    state: Mutex<ProjectState>,
}

impl ProjectSession {
    pub fn new(project: Project, state: ProjectState) -> Self {
        Self {
            project,
            state: Mutex::new(state),
        }
    }

    pub fn id(&self) -> &str {
        &self.project.id
    }

    pub fn path(&self) -> &str {
        &self.project.path
    }

    pub async fn lock(&self) -> MutexGuard<'_, ProjectState> {
        self.state.lock().await
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.auto_mode.is_running
    }

    pub async fn auto_mode(&self) -> AutoModeState {
        self.state.lock().await.auto_mode.clone()
    }

    pub async fn pending(&self) -> BTreeSet<FeatureId> {
        self.state.lock().await.pending.clone()
    }

    pub async fn features(&self) -> Vec<Feature> {
        self.state.lock().await.features.list()
    }

    pub async fn feature(&self, id: &str) -> Option<Feature> {
        self.state.lock().await.features.get(id)
    }

    /// Replace the feature set (e.g. after the host reloads from disk).
    /// Auto-mode bookkeeping is left alone.
    pub async fn replace_features(&self, features: Vec<Feature>) {
        self.state.lock().await.features = crate::store::FeatureStore::from_features(features);
    }

    pub async fn upsert_feature(&self, feature: Feature) {
        self.state.lock().await.features.insert(feature);
    }

    pub async fn apply_event(&self, event: &AutoModeEvent) -> Vec<BoardEvent> {
        let mut state = self.state.lock().await;
        reconciler::reconcile(&self.project.id, &mut state, event)
    }
}
