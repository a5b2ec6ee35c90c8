use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type FeatureId = String;
pub type ProjectId = String;

// ── Feature ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Not yet started; the only status the scheduler promotes from.
    #[default]
    Backlog,
    InProgress,
    /// Agent finished (or paused on a plan) and a human needs to look.
    WaitingApproval,
    Verified,
    /// Archival.
    Completed,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Verified => "verified",
            Self::Completed => "completed",
        }
    }

    /// Whether a dependent feature may start once a prerequisite reaches this status.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Verified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Approved,
    Rejected,
}

/// Agent-authored plan that may need a human sign-off before implementation continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub status: PlanStatus,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureOutcome {
    Passed,
    Failed,
}

/// A unit of agent work on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: FeatureId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: FeatureStatus,
    /// Branch whose worktree owns this feature. None = unassigned.
    #[serde(default)]
    pub branch_name: Option<String>,
    /// Lower runs first. None sorts after every explicit priority.
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub dependencies: Vec<FeatureId>,
    #[serde(default)]
    pub plan_spec: Option<PlanSpec>,
    /// Last error reported for this feature by the execution service.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_outcome: Option<FeatureOutcome>,
}

impl Feature {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: FeatureStatus::Backlog,
            branch_name: None,
            priority: None,
            dependencies: Vec::new(),
            plan_spec: None,
            error: None,
            last_outcome: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: FeatureStatus) -> Self {
        self.status = status;
        self
    }

    pub fn awaiting_plan_approval(&self) -> bool {
        self.plan_spec
            .as_ref()
            .is_some_and(|p| p.status == PlanStatus::Pending)
    }
}

/// Partial update for a feature. `None` leaves a field untouched; for the
/// optional fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FeatureStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Option<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_spec: Option<Option<PlanSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<FeatureOutcome>,
}

impl FeaturePatch {
    pub fn status(status: FeatureStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch_name: Some(Some(branch.into())),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, feature: &mut Feature) {
        if let Some(status) = self.status {
            feature.status = status;
        }
        if let Some(branch) = &self.branch_name {
            feature.branch_name = branch.clone();
        }
        if let Some(priority) = self.priority {
            feature.priority = priority;
        }
        if let Some(plan) = &self.plan_spec {
            feature.plan_spec = plan.clone();
        }
        if let Some(error) = &self.error {
            feature.error = error.clone();
        }
        if let Some(outcome) = self.last_outcome {
            feature.last_outcome = Some(outcome);
        }
    }
}

// ── Projects ─────────────────────────────────────────────────────────────

/// A git repository opened on the board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub path: String,
}

impl Project {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Per-project auto-mode state. `is_running == false` only stops promotion;
/// `running_task_ids` drains through events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoModeState {
    pub is_running: bool,
    pub running_task_ids: BTreeSet<FeatureId>,
    pub max_concurrency: usize,
    /// Branch scope the loop was enabled for, if any.
    pub branch_name: Option<String>,
}

// ── Worktrees ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeDescriptor {
    /// None for the primary worktree.
    pub path: Option<String>,
    pub branch: String,
    pub is_main: bool,
    #[serde(default)]
    pub has_changes: bool,
}

/// The branch/worktree currently visible to the user for a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveScope {
    /// None = primary worktree.
    pub worktree_path: Option<String>,
    /// None until worktree info has been loaded.
    pub branch: Option<String>,
}

impl ActiveScope {
    pub fn is_primary(&self) -> bool {
        self.worktree_path.is_none()
    }
}

// ── Board notifications ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Execution,
}

/// Broadcast after the reconciler applies a user-visible transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEvent {
    FeatureStarted {
        project_id: ProjectId,
        feature_id: FeatureId,
    },
    FeatureCompleted {
        project_id: ProjectId,
        feature_id: FeatureId,
        passes: bool,
        message: String,
    },
    FeatureFailed {
        project_id: ProjectId,
        feature_id: Option<FeatureId>,
        kind: ErrorKind,
        message: String,
    },
    PlanApprovalRequired {
        project_id: ProjectId,
        feature_id: FeatureId,
        version: u32,
    },
    AutoModeChanged {
        project_id: ProjectId,
        is_running: bool,
    },
}

impl BoardEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::FeatureStarted { .. } => "feature_started",
            Self::FeatureCompleted { .. } => "feature_completed",
            Self::FeatureFailed { .. } => "feature_failed",
            Self::PlanApprovalRequired { .. } => "plan_approval_required",
            Self::AutoModeChanged { .. } => "auto_mode_changed",
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::FeatureStarted { project_id, .. }
            | Self::FeatureCompleted { project_id, .. }
            | Self::FeatureFailed { project_id, .. }
            | Self::PlanApprovalRequired { project_id, .. }
            | Self::AutoModeChanged { project_id, .. } => project_id,
        }
    }

    pub fn feature_id(&self) -> Option<&str> {
        match self {
            Self::FeatureStarted { feature_id, .. }
            | Self::FeatureCompleted { feature_id, .. }
            | Self::PlanApprovalRequired { feature_id, .. } => Some(feature_id),
            Self::FeatureFailed { feature_id, .. } => feature_id.as_deref(),
            Self::AutoModeChanged { .. } => None,
        }
    }
}

// ── Activity ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Progress,
    Tool,
    Phase,
}

/// One line in a project's agent activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub feature_id: Option<FeatureId>,
    pub kind: ActivityKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
