use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::ProjectId;

/// Auto-mode flags that survive a restart. Running task ids are not kept:
/// they are rebuilt from the event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoModeSnapshot {
    #[serde(default)]
    pub projects: BTreeMap<ProjectId, PersistedProject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub path: String,
    pub is_running: bool,
    pub max_concurrency: usize,
    #[serde(default)]
    pub branch_name: Option<String>,
}

/// Missing file = empty snapshot.
pub fn load(path: &Path) -> Result<AutoModeSnapshot> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AutoModeSnapshot::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Move an unreadable state file out of the way so the next save does not
/// destroy it. Returns where it went.
pub fn set_aside(path: &Path) -> Result<PathBuf> {
    let kept = path.with_extension("json.corrupt");
    std::fs::rename(path, &kept)
        .with_context(|| format!("move {} to {}", path.display(), kept.display()))?;
    Ok(kept)
}

/// Write via a sibling temp file and rename so readers never see a partial file.
pub fn save(path: &Path, snapshot: &AutoModeSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(snapshot).context("serialize auto-mode snapshot")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = load(&dir.path().join("nope.json")).unwrap();
        assert!(snap.projects.is_empty());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("auto-mode.json");
        let mut snap = AutoModeSnapshot::default();
        snap.projects.insert(
            "p1".into(),
            PersistedProject {
                path: "/repo".into(),
                is_running: true,
                max_concurrency: 2,
                branch_name: Some("main".into()),
            },
        );
        save(&path, &snap).unwrap();
        assert_eq!(load(&path).unwrap(), snap);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto-mode.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn corrupt_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto-mode.json");
        std::fs::write(&path, "{not json").unwrap();

        let kept = set_aside(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(kept).unwrap(), "{not json");
    }
}
