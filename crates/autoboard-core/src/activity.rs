use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::types::{ActivityEntry, ActivityKind};

pub const DEFAULT_MAX_ENTRIES: usize = 500;
pub const DEFAULT_MAX_PROGRESS_CHARS: usize = 2_000;

/// Bounded agent activity feed for one project.
///
/// Keeps the most recent entries for replay and broadcasts each new entry to
/// live subscribers. Text is truncated on the way in so a chatty agent cannot
/// grow the feed without bound.
pub struct ActivityLog {
    tx: broadcast::Sender<ActivityEntry>,
    history: VecDeque<ActivityEntry>,
    max_entries: usize,
    max_chars: usize,
}

impl ActivityLog {
    pub fn new(max_entries: usize, max_chars: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: VecDeque::new(),
            max_entries: max_entries.max(1),
            max_chars: max_chars.max(1),
        }
    }

    pub fn push(&mut self, feature_id: Option<String>, kind: ActivityKind, message: &str) {
        let entry = ActivityEntry {
            feature_id,
            kind,
            message: truncate_chars(message, self.max_chars),
            timestamp: Utc::now(),
        };
        let _ = self.tx.send(entry.clone());
        self.history.push_back(entry);
        while self.history.len() > self.max_entries {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// History snapshot plus a live receiver. Subscribe happens first so no
    /// entry pushed between the two is lost.
    pub fn subscribe(&self) -> (Vec<ActivityEntry>, broadcast::Receiver<ActivityEntry>) {
        let rx = self.tx.subscribe();
        (self.history.iter().cloned().collect(), rx)
    }

    pub fn for_feature(&self, feature_id: &str) -> Vec<ActivityEntry> {
        self.history
            .iter()
            .filter(|e| e.feature_id.as_deref() == Some(feature_id))
            .cloned()
            .collect()
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_PROGRESS_CHARS)
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
    }
}
