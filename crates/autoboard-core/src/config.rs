use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Result;

use crate::{
    activity::{DEFAULT_MAX_ENTRIES, DEFAULT_MAX_PROGRESS_CHARS},
    scheduler::SchedulerConfig,
    service::ServiceOptions,
};

/// Process configuration. Values come from the environment, then `.env`,
/// then the defaults below.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Scheduling
    pub max_concurrency: usize,
    pub enable_dependency_blocking: bool,
    pub poll_interval_ms: u64,
    pub require_plan_approval: bool,

    // Execution service
    pub gateway_url: String,
    pub gateway_timeout_s: u64,

    // Control server
    pub web_bind: String,
    pub web_port: u16,

    // Activity log
    pub max_activity_entries: usize,
    pub max_progress_chars: usize,

    /// Project that anonymous events are attributed to at startup.
    pub active_project: Option<String>,
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Ok(Self::from_lookup(|key| {
            std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
        }))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let src = Source { lookup };
        Config {
            data_dir: src.get_str("AUTOBOARD_DATA_DIR", "store"),
            max_concurrency: src.get_usize("MAX_CONCURRENCY", 3).max(1),
            enable_dependency_blocking: src.get_bool("ENABLE_DEPENDENCY_BLOCKING", true),
            poll_interval_ms: src.get_u64("POLL_INTERVAL_MS", 3_000).max(100),
            require_plan_approval: src.get_bool("REQUIRE_PLAN_APPROVAL", false),
            gateway_url: src
                .get_str("GATEWAY_URL", "http://127.0.0.1:3008")
                .trim_end_matches('/')
                .to_string(),
            gateway_timeout_s: src.get_u64("GATEWAY_TIMEOUT_S", 30),
            web_bind: src.get_str("WEB_BIND", "127.0.0.1"),
            web_port: src.get_u16("WEB_PORT", 3131),
            max_activity_entries: src.get_usize("MAX_ACTIVITY_ENTRIES", DEFAULT_MAX_ENTRIES).max(1),
            max_progress_chars: src.get_usize("MAX_PROGRESS_CHARS", DEFAULT_MAX_PROGRESS_CHARS),
            active_project: src.get("ACTIVE_PROJECT"),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("auto-mode.json")
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.max_concurrency,
            enable_dependency_blocking: self.enable_dependency_blocking,
            require_plan_approval: self.require_plan_approval,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            scheduler: self.scheduler_config(),
            max_activity_entries: self.max_activity_entries,
            max_progress_chars: self.max_progress_chars,
            state_path: Some(self.state_path()),
        }
    }
}
