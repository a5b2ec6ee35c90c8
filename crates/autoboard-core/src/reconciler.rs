//! Authoritative state transitions driven by the execution service's events.
//!
//! Everything here is synchronous and idempotent: replaying an event that has
//! already been applied leaves the state unchanged and emits no notification.

use tracing::{debug, info, warn};

use crate::{
    event::{classify_error, user_message, AutoModeEvent, EventKind},
    session::ProjectState,
    types::{
        ActivityKind, BoardEvent, FeatureOutcome, FeaturePatch, FeatureStatus, PlanSpec,
        PlanStatus,
    },
};

pub fn reconcile(
    project_id: &str,
    state: &mut ProjectState,
    event: &AutoModeEvent,
) -> Vec<BoardEvent> {
    let mut out = Vec::new();
    match &event.kind {
        EventKind::FeatureStart { feature_id } => {
            state.pending.remove(feature_id);
            let newly = state.auto_mode.running_task_ids.insert(feature_id.clone());
            set_status(state, feature_id, FeatureStatus::InProgress);
            if newly {
                info!(project = project_id, feature_id = %feature_id, "feature started");
                out.push(BoardEvent::FeatureStarted {
                    project_id: project_id.to_string(),
                    feature_id: feature_id.clone(),
                });
            }
        }

        EventKind::FeatureComplete {
            feature_id,
            passes,
            message,
        } => {
            let was_running = state.auto_mode.running_task_ids.remove(feature_id);
            let was_pending = state.pending.remove(feature_id);
            // A missing flag means the service did not report a failure.
            let passes = passes.unwrap_or(true);
            let (status, outcome) = if passes {
                (FeatureStatus::Verified, FeatureOutcome::Passed)
            } else {
                (FeatureStatus::WaitingApproval, FeatureOutcome::Failed)
            };
            let changed = match state.features.authoritative(feature_id) {
                Some(f) if f.status == FeatureStatus::InProgress || was_running || was_pending => {
                    let patch = FeaturePatch {
                        status: Some(status),
                        last_outcome: Some(outcome),
                        error: Some(None),
                        ..Default::default()
                    };
                    let mut next = f.clone();
                    patch.apply(&mut next);
                    if next != *f {
                        state.features.update(feature_id, &patch);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if was_running || was_pending || changed {
                info!(project = project_id, feature_id = %feature_id, passes, "feature completed");
                out.push(BoardEvent::FeatureCompleted {
                    project_id: project_id.to_string(),
                    feature_id: feature_id.clone(),
                    passes,
                    message: message.clone().unwrap_or_default(),
                });
            }
        }

        EventKind::Error {
            feature_id,
            error,
            error_type,
        } => {
            let kind = classify_error(error, error_type.as_deref());
            let message = user_message(kind, error);
            let mut changed = false;
            if let Some(id) = feature_id {
                changed |= state.auto_mode.running_task_ids.remove(id);
                changed |= state.pending.remove(id);
                if let Some(f) = state.features.authoritative(id) {
                    let mut patch = FeaturePatch::default();
                    if f.status == FeatureStatus::InProgress {
                        patch.status = Some(FeatureStatus::Backlog);
                    }
                    if f.error.as_deref() != Some(error.as_str()) {
                        patch.error = Some(Some(error.clone()));
                    }
                    if !patch.is_empty() {
                        state.features.update(id, &patch);
                        changed = true;
                    }
                }
            } else {
                changed = true;
            }
            if changed {
                warn!(
                    project = project_id,
                    feature_id = feature_id.as_deref().unwrap_or("-"),
                    kind = ?kind,
                    "feature error: {error}"
                );
                out.push(BoardEvent::FeatureFailed {
                    project_id: project_id.to_string(),
                    feature_id: feature_id.clone(),
                    kind,
                    message,
                });
            }
        }

        EventKind::Started => {
            if !state.auto_mode.is_running {
                state.auto_mode.is_running = true;
                out.push(BoardEvent::AutoModeChanged {
                    project_id: project_id.to_string(),
                    is_running: true,
                });
            }
        }

        EventKind::Stopped => {
            let was_running = state.auto_mode.is_running;
            state.auto_mode.is_running = false;
            state.auto_mode.running_task_ids.clear();
            state.pending.clear();
            if was_running {
                info!(project = project_id, "auto mode stopped by service");
                out.push(BoardEvent::AutoModeChanged {
                    project_id: project_id.to_string(),
                    is_running: false,
                });
            }
        }

        EventKind::Idle => {
            debug!(project = project_id, "auto mode idle");
        }

        EventKind::Progress {
            feature_id,
            content,
        } => {
            state
                .activity
                .push(feature_id.clone(), ActivityKind::Progress, content);
        }

        EventKind::Tool {
            feature_id, tool, ..
        } => {
            state
                .activity
                .push(feature_id.clone(), ActivityKind::Tool, tool);
        }

        EventKind::Phase {
            feature_id,
            phase,
            message,
        } => {
            let text = match message {
                Some(m) if !m.is_empty() => format!("{phase}: {m}"),
                _ => phase.clone(),
            };
            state.activity.push(feature_id.clone(), ActivityKind::Phase, &text);
        }

        EventKind::PlanApprovalRequired {
            feature_id,
            plan_content,
            plan_version,
        } => {
            let plan = PlanSpec {
                status: PlanStatus::Pending,
                content: plan_content.clone(),
                version: plan_version.unwrap_or(1),
            };
            let changed = match state.features.authoritative(feature_id) {
                Some(f)
                    if f.plan_spec.as_ref() != Some(&plan)
                        || f.status != FeatureStatus::WaitingApproval =>
                {
                    let patch = FeaturePatch {
                        status: Some(FeatureStatus::WaitingApproval),
                        plan_spec: Some(Some(plan.clone())),
                        ..Default::default()
                    };
                    state.features.update(feature_id, &patch);
                    true
                }
                _ => false,
            };
            if changed {
                info!(
                    project = project_id,
                    feature_id = %feature_id,
                    version = plan.version,
                    "plan awaiting approval"
                );
                out.push(BoardEvent::PlanApprovalRequired {
                    project_id: project_id.to_string(),
                    feature_id: feature_id.clone(),
                    version: plan.version,
                });
            }
        }

        EventKind::Unknown => {
            debug!(project = project_id, "ignoring unknown auto-mode event");
        }
    }
    out
}

fn set_status(state: &mut ProjectState, feature_id: &str, status: FeatureStatus) {
    let needs_update = state
        .features
        .authoritative(feature_id)
        .is_some_and(|f| f.status != status);
    if needs_update {
        state.features.update(feature_id, &FeaturePatch::status(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{activity::ActivityLog, types::Feature, types::ErrorKind};

    fn state() -> ProjectState {
        ProjectState::new(3, ActivityLog::new(10, 16)).with_features([
            Feature::new("f1", "one"),
            Feature::new("f2", "two"),
        ])
    }

    fn ev(kind: EventKind) -> AutoModeEvent {
        AutoModeEvent::new(kind).for_project("p")
    }

    fn start(id: &str) -> AutoModeEvent {
        ev(EventKind::FeatureStart {
            feature_id: id.into(),
        })
    }

    fn complete(id: &str, passes: bool) -> AutoModeEvent {
        ev(EventKind::FeatureComplete {
            feature_id: id.into(),
            passes: Some(passes),
            message: None,
        })
    }

    #[test]
    fn start_moves_pending_to_running() {
        let mut s = state();
        s.pending.insert("f1".into());
        let out = reconcile("p", &mut s, &start("f1"));
        assert!(s.pending.is_empty());
        assert!(s.auto_mode.running_task_ids.contains("f1"));
        assert_eq!(s.features.get("f1").unwrap().status, FeatureStatus::InProgress);
        assert_eq!(out.len(), 1);

        assert!(reconcile("p", &mut s, &start("f1")).is_empty());
    }

    #[test]
    fn complete_is_idempotent() {
        let mut s = state();
        reconcile("p", &mut s, &start("f1"));
        let first = reconcile("p", &mut s, &complete("f1", true));
        assert_eq!(first.len(), 1);
        let features_after_once = s.features.list();
        let auto_after_once = s.auto_mode.clone();

        let second = reconcile("p", &mut s, &complete("f1", true));
        assert!(second.is_empty());
        assert_eq!(s.features.list(), features_after_once);
        assert_eq!(s.auto_mode, auto_after_once);

        let f1 = s.features.get("f1").unwrap();
        assert_eq!(f1.status, FeatureStatus::Verified);
        assert_eq!(f1.last_outcome, Some(FeatureOutcome::Passed));
    }

    #[test]
    fn failed_completion_waits_for_review() {
        let mut s = state();
        reconcile("p", &mut s, &start("f2"));
        reconcile("p", &mut s, &complete("f2", false));
        let f2 = s.features.get("f2").unwrap();
        assert_eq!(f2.status, FeatureStatus::WaitingApproval);
        assert_eq!(f2.last_outcome, Some(FeatureOutcome::Failed));
        assert!(s.auto_mode.running_task_ids.is_empty());
    }

    #[test]
    fn auth_error_is_classified_and_feature_returns_to_backlog() {
        let mut s = state();
        reconcile("p", &mut s, &start("f1"));
        let out = reconcile(
            "p",
            &mut s,
            &ev(EventKind::Error {
                feature_id: Some("f1".into()),
                error: "Invalid API key".into(),
                error_type: None,
            }),
        );
        assert!(s.auto_mode.running_task_ids.is_empty());
        let f1 = s.features.get("f1").unwrap();
        assert_eq!(f1.status, FeatureStatus::Backlog);
        assert_eq!(f1.error.as_deref(), Some("Invalid API key"));
        match &out[..] {
            [BoardEvent::FeatureFailed { kind, message, .. }] => {
                assert_eq!(*kind, ErrorKind::Authentication);
                assert!(message.starts_with("Authentication failed"));
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[test]
    fn error_clears_pending() {
        let mut s = state();
        s.pending.insert("f2".into());
        reconcile(
            "p",
            &mut s,
            &ev(EventKind::Error {
                feature_id: Some("f2".into()),
                error: "crashed".into(),
                error_type: Some("execution".into()),
            }),
        );
        assert!(s.pending.is_empty());
    }

    #[test]
    fn stopped_clears_running_and_disables() {
        let mut s = state();
        s.auto_mode.is_running = true;
        reconcile("p", &mut s, &start("f1"));
        reconcile("p", &mut s, &ev(EventKind::Stopped));
        assert!(!s.auto_mode.is_running);
        assert!(s.auto_mode.running_task_ids.is_empty());
    }

    #[test]
    fn idle_changes_nothing() {
        let mut s = state();
        s.auto_mode.is_running = true;
        let before = (s.features.list(), s.auto_mode.clone());
        assert!(reconcile("p", &mut s, &ev(EventKind::Idle)).is_empty());
        assert_eq!((s.features.list(), s.auto_mode.clone()), before);
    }

    #[test]
    fn progress_goes_to_activity_truncated() {
        let mut s = state();
        reconcile(
            "p",
            &mut s,
            &ev(EventKind::Progress {
                feature_id: Some("f1".into()),
                content: "y".repeat(64),
            }),
        );
        reconcile(
            "p",
            &mut s,
            &ev(EventKind::Phase {
                feature_id: Some("f1".into()),
                phase: "planning".into(),
                message: Some("drafting".into()),
            }),
        );
        let entries = s.activity.for_feature("f1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, format!("{}...", "y".repeat(16)));
        assert_eq!(entries[1].message, "planning: drafting");
        assert!(s.auto_mode.running_task_ids.is_empty());
    }

    #[test]
    fn plan_approval_marks_pending_plan() {
        let mut s = state();
        reconcile("p", &mut s, &start("f1"));
        let plan_ev = ev(EventKind::PlanApprovalRequired {
            feature_id: "f1".into(),
            plan_content: "1. do it".into(),
            plan_version: Some(2),
        });
        assert_eq!(reconcile("p", &mut s, &plan_ev).len(), 1);
        let f1 = s.features.get("f1").unwrap();
        assert!(f1.awaiting_plan_approval());
        assert_eq!(f1.status, FeatureStatus::WaitingApproval);
        assert!(s.auto_mode.running_task_ids.contains("f1"));
        assert!(reconcile("p", &mut s, &plan_ev).is_empty());
    }
}
