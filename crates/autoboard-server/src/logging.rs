use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;

pub(crate) const LOG_RING_SIZE: usize = 500;

/// Mirrors log lines as JSON into a bounded ring and a broadcast channel so
/// `/api/logs` can replay recent history and then follow live.
pub(crate) struct BroadcastLayer {
    pub tx: broadcast::Sender<String>,
    pub ring: Arc<Mutex<VecDeque<String>>>,
}

struct FieldVisitor<'a> {
    message: &'a mut String,
    project: &'a mut Option<String>,
    feature_id: &'a mut Option<String>,
}

impl FieldVisitor<'_> {
    fn set(&mut self, name: &str, value: String) {
        match name {
            "message" => *self.message = value,
            "project" => *self.project = Some(value),
            "feature_id" => *self.feature_id = Some(value),
            _ => {}
        }
    }
}

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.set(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let mut text = format!("{value:?}");
        // Debug on &str adds quotes
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            text = text[1..text.len() - 1].to_string();
        }
        self.set(field.name(), text);
    }
}

pub(crate) fn category(target: &str) -> &'static str {
    if target.contains("scheduler") || target.contains("service") {
        "scheduler"
    } else if target.contains("reconciler") {
        "events"
    } else if target.contains("gateway") {
        "gateway"
    } else if target.contains("tower_http") || target.contains("autoboard_server") {
        "http"
    } else {
        "system"
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BroadcastLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = match *event.metadata().level() {
            tracing::Level::ERROR => "err",
            tracing::Level::WARN => "warn",
            tracing::Level::INFO => "info",
            tracing::Level::DEBUG => "debug",
            tracing::Level::TRACE => return,
        };

        let mut message = String::new();
        let mut project = None;
        let mut feature_id = None;
        event.record(&mut FieldVisitor {
            message: &mut message,
            project: &mut project,
            feature_id: &mut feature_id,
        });

        let json = serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "level": level,
            "message": message,
            "category": category(event.metadata().target()),
            "project": project,
            "featureId": feature_id,
        })
        .to_string();

        let _ = self.tx.send(json.clone());
        if let Ok(mut ring) = self.ring.lock() {
            ring.push_back(json);
            while ring.len() > LOG_RING_SIZE {
                ring.pop_front();
            }
        }
    }
}
