use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::types::ErrorKind;

/// One message from the execution service's event stream.
///
/// Project attribution is optional on the wire; see the service's routing
/// for the fallback rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoModeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventKind {
    #[serde(rename = "auto_mode_feature_start")]
    FeatureStart { feature_id: String },

    #[serde(rename = "auto_mode_feature_complete")]
    FeatureComplete {
        feature_id: String,
        #[serde(default)]
        passes: Option<bool>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "auto_mode_error")]
    Error {
        #[serde(default)]
        feature_id: Option<String>,
        #[serde(default)]
        error: String,
        /// Service-side classification, e.g. "authentication".
        #[serde(default)]
        error_type: Option<String>,
    },

    /// The service-side loop for the project is up.
    #[serde(rename = "auto_mode_started")]
    Started,

    #[serde(rename = "auto_mode_stopped")]
    Stopped,

    /// Loop alive, nothing to pick up.
    #[serde(rename = "auto_mode_idle")]
    Idle,

    #[serde(rename = "auto_mode_progress")]
    Progress {
        #[serde(default)]
        feature_id: Option<String>,
        #[serde(default)]
        content: String,
    },

    #[serde(rename = "auto_mode_tool")]
    Tool {
        #[serde(default)]
        feature_id: Option<String>,
        tool: String,
        #[serde(default)]
        input: Option<Value>,
    },

    #[serde(rename = "auto_mode_phase")]
    Phase {
        #[serde(default)]
        feature_id: Option<String>,
        phase: String,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "plan_approval_required")]
    PlanApprovalRequired {
        feature_id: String,
        #[serde(default)]
        plan_content: String,
        #[serde(default)]
        plan_version: Option<u32>,
    },

    #[serde(other)]
    Unknown,
}

impl AutoModeEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            project_id: None,
            project_path: None,
            kind,
        }
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn for_path(mut self, project_path: impl Into<String>) -> Self {
        self.project_path = Some(project_path.into());
        self
    }

    pub fn feature_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::FeatureStart { feature_id }
            | EventKind::FeatureComplete { feature_id, .. }
            | EventKind::PlanApprovalRequired { feature_id, .. } => Some(feature_id),
            EventKind::Error { feature_id, .. }
            | EventKind::Progress { feature_id, .. }
            | EventKind::Tool { feature_id, .. }
            | EventKind::Phase { feature_id, .. } => feature_id.as_deref(),
            EventKind::Started | EventKind::Stopped | EventKind::Idle | EventKind::Unknown => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::FeatureStart { .. } => "feature_start",
            EventKind::FeatureComplete { .. } => "feature_complete",
            EventKind::Error { .. } => "error",
            EventKind::Started => "started",
            EventKind::Stopped => "stopped",
            EventKind::Idle => "idle",
            EventKind::Progress { .. } => "progress",
            EventKind::Tool { .. } => "tool",
            EventKind::Phase { .. } => "phase",
            EventKind::PlanApprovalRequired { .. } => "plan_approval_required",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Decode one JSON event. Malformed input yields None.
pub fn decode_event(line: &str) -> Option<AutoModeEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            debug!("dropping malformed auto-mode event: {e}");
            None
        }
    }
}

// ── Error classification ─────────────────────────────────────────────────

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "invalid api key",
    "authentication_failed",
    "authentication_error",
    "fix external api key",
    "invalid x-api-key",
];

pub fn classify_error(message: &str, error_type: Option<&str>) -> ErrorKind {
    if error_type.is_some_and(|t| t.eq_ignore_ascii_case("authentication")) {
        return ErrorKind::Authentication;
    }
    let lower = message.to_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorKind::Authentication
    } else {
        ErrorKind::Execution
    }
}

/// Message shown to the user for a failed feature.
pub fn user_message(kind: ErrorKind, error: &str) -> String {
    match kind {
        ErrorKind::Authentication => format!(
            "Authentication failed: check the agent API key or re-run the CLI login, then retry. ({error})"
        ),
        ErrorKind::Execution if error.is_empty() => "Feature execution failed".to_string(),
        ErrorKind::Execution => format!("Feature execution failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_feature_start_with_project_path() {
        let ev = decode_event(
            r#"{"type":"auto_mode_feature_start","projectPath":"/repo","featureId":"f1"}"#,
        )
        .unwrap();
        assert_eq!(ev.project_path.as_deref(), Some("/repo"));
        assert_eq!(ev.project_id, None);
        assert_eq!(
            ev.kind,
            EventKind::FeatureStart {
                feature_id: "f1".into()
            }
        );
    }

    #[test]
    fn decodes_complete_and_error() {
        let ev = decode_event(
            r#"{"type":"auto_mode_feature_complete","projectId":"p","featureId":"f","passes":false}"#,
        )
        .unwrap();
        assert!(matches!(
            ev.kind,
            EventKind::FeatureComplete {
                passes: Some(false),
                ..
            }
        ));

        let ev = decode_event(
            r#"{"type":"auto_mode_error","featureId":"f","error":"boom","errorType":"execution"}"#,
        )
        .unwrap();
        assert_eq!(ev.feature_id(), Some("f"));
        assert_eq!(ev.kind_name(), "error");
    }

    #[test]
    fn unit_events_tolerate_extra_fields() {
        let ev = decode_event(r#"{"type":"auto_mode_stopped","projectId":"p","reason":"x"}"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Stopped);
        assert_eq!(ev.project_id.as_deref(), Some("p"));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let ev = decode_event(r#"{"type":"something_new","projectId":"p"}"#).unwrap();
        assert_eq!(ev.kind, EventKind::Unknown);
    }

    #[test]
    fn malformed_is_dropped() {
        assert!(decode_event("not json").is_none());
        assert!(decode_event("").is_none());
        assert!(decode_event(r#"{"type":"auto_mode_feature_start"}"#).is_none());
    }

    #[test]
    fn classifies_auth_by_substring_or_flag() {
        assert_eq!(
            classify_error("Error: Authentication failed for request", None),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_error("401 invalid API key provided", None),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_error("whatever", Some("authentication")),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_error("tests failed", Some("execution")),
            ErrorKind::Execution
        );
    }

    #[test]
    fn auth_message_is_distinct() {
        let auth = user_message(ErrorKind::Authentication, "Invalid API key");
        let exec = user_message(ErrorKind::Execution, "Invalid API key");
        assert_ne!(auth, exec);
        assert!(auth.starts_with("Authentication failed"));
    }
}
