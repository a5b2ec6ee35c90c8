use std::{collections::HashMap, process::Command, sync::RwLock};

use anyhow::{anyhow, Context, Result};

use crate::types::{ActiveScope, WorktreeDescriptor};

#[derive(Debug, Default, Clone)]
struct ProjectWorktrees {
    /// None until the first refresh lands.
    descriptors: Option<Vec<WorktreeDescriptor>>,
    /// Worktree path the user is looking at. None = primary.
    selected: Option<String>,
}

/// Per-project branch → worktree lookup.
///
/// Pure lookup: the descriptor set is pushed in by whoever fetches worktree
/// info (see [`list_worktrees`]) whenever worktrees are created or deleted.
#[derive(Debug, Default)]
pub struct WorktreeRegistry {
    projects: RwLock<HashMap<String, ProjectWorktrees>>,
}

impl WorktreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the descriptor snapshot for a project.
    pub fn refresh(&self, project_id: &str, descriptors: Vec<WorktreeDescriptor>) {
        let mut map = self.projects.write().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(project_id.to_string()).or_default();
        entry.descriptors = Some(descriptors);
    }

    /// Change the visible worktree. `None` selects the primary worktree.
    pub fn select(&self, project_id: &str, worktree_path: Option<String>) {
        let mut map = self.projects.write().unwrap_or_else(|e| e.into_inner());
        map.entry(project_id.to_string()).or_default().selected = worktree_path;
    }

    pub fn descriptors(&self, project_id: &str) -> Vec<WorktreeDescriptor> {
        let map = self.projects.read().unwrap_or_else(|e| e.into_inner());
        map.get(project_id)
            .and_then(|p| p.descriptors.clone())
            .unwrap_or_default()
    }

    pub fn active_scope(&self, project_id: &str) -> ActiveScope {
        let map = self.projects.read().unwrap_or_else(|e| e.into_inner());
        let Some(project) = map.get(project_id) else {
            return ActiveScope::default();
        };
        let descriptors = project.descriptors.as_deref().unwrap_or_default();
        let branch = match &project.selected {
            None => descriptors.iter().find(|d| d.is_main).map(|d| d.branch.clone()),
            Some(path) => descriptors
                .iter()
                .find(|d| d.path.as_deref() == Some(path.as_str()))
                .map(|d| d.branch.clone()),
        };
        ActiveScope {
            worktree_path: project.selected.clone(),
            branch,
        }
    }

    pub fn primary_branch(&self, project_id: &str) -> Option<String> {
        let map = self.projects.read().unwrap_or_else(|e| e.into_inner());
        map.get(project_id)?
            .descriptors
            .as_ref()?
            .iter()
            .find(|d| d.is_main)
            .map(|d| d.branch.clone())
    }

    /// False while worktree info is still unknown.
    pub fn is_primary_branch(&self, project_id: &str, branch: &str) -> bool {
        self.primary_branch(project_id).as_deref() == Some(branch)
    }

    pub fn worktree_for_branch(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Option<WorktreeDescriptor> {
        let map = self.projects.read().unwrap_or_else(|e| e.into_inner());
        map.get(project_id)?
            .descriptors
            .as_ref()?
            .iter()
            .find(|d| d.branch == branch)
            .cloned()
    }
}

// ── Worktree discovery ───────────────────────────────────────────────────

/// Parse `git worktree list --porcelain`. The first record is the primary
/// worktree and gets `path: None`; detached and bare entries are skipped.
pub fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeDescriptor> {
    let mut out = Vec::new();
    let mut first = true;
    for record in output.split("\n\n") {
        let mut path = None;
        let mut branch = None;
        let mut skip = false;
        for line in record.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(p.trim().to_string());
            } else if let Some(b) = line.strip_prefix("branch ") {
                let b = b.trim();
                branch = Some(b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
            } else if line == "bare" || line == "detached" {
                skip = true;
            }
        }
        let Some(path) = path else { continue };
        let is_main = first;
        first = false;
        if skip {
            continue;
        }
        let Some(branch) = branch else { continue };
        out.push(WorktreeDescriptor {
            path: if is_main { None } else { Some(path) },
            branch,
            is_main,
            has_changes: false,
        });
    }
    out
}

/// Read the worktree set of a repository through the git CLI, marking
/// worktrees with uncommitted changes.
pub fn list_worktrees(repo_path: &str) -> Result<Vec<WorktreeDescriptor>> {
    let listing = git(repo_path, &["worktree", "list", "--porcelain"])?;
    let mut descriptors = parse_worktree_porcelain(&listing);
    for d in &mut descriptors {
        let dir = d.path.as_deref().unwrap_or(repo_path);
        d.has_changes = git(dir, &["status", "--porcelain"])
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
    }
    Ok(descriptors)
}

fn git(dir: &str, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed in {dir}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors() -> Vec<WorktreeDescriptor> {
        vec![
            WorktreeDescriptor {
                path: None,
                branch: "main".into(),
                is_main: true,
                has_changes: false,
            },
            WorktreeDescriptor {
                path: Some("/wt/feat-x".into()),
                branch: "feat-x".into(),
                is_main: false,
                has_changes: true,
            },
        ]
    }

    #[test]
    fn scope_is_primary_with_unknown_branch_before_refresh() {
        let reg = WorktreeRegistry::new();
        let scope = reg.active_scope("p");
        assert!(scope.is_primary());
        assert_eq!(scope.branch, None);
        assert!(!reg.is_primary_branch("p", "main"));
    }

    #[test]
    fn scope_follows_selection() {
        let reg = WorktreeRegistry::new();
        reg.refresh("p", descriptors());
        assert_eq!(reg.active_scope("p").branch.as_deref(), Some("main"));

        reg.select("p", Some("/wt/feat-x".into()));
        let scope = reg.active_scope("p");
        assert!(!scope.is_primary());
        assert_eq!(scope.branch.as_deref(), Some("feat-x"));

        reg.select("p", None);
        assert!(reg.active_scope("p").is_primary());
    }

    #[test]
    fn selected_path_without_descriptor_has_unknown_branch() {
        let reg = WorktreeRegistry::new();
        reg.select("p", Some("/wt/new".into()));
        let scope = reg.active_scope("p");
        assert_eq!(scope.worktree_path.as_deref(), Some("/wt/new"));
        assert_eq!(scope.branch, None);
    }

    #[test]
    fn primary_branch_lookup() {
        let reg = WorktreeRegistry::new();
        reg.refresh("p", descriptors());
        assert!(reg.is_primary_branch("p", "main"));
        assert!(!reg.is_primary_branch("p", "feat-x"));
        assert!(!reg.is_primary_branch("other", "main"));
        assert!(reg.worktree_for_branch("p", "feat-x").unwrap().has_changes);
    }

    #[test]
    fn porcelain_parsing() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /repo/.worktrees/feat-x\nHEAD def\nbranch refs/heads/feat-x\n\n\
                   worktree /repo/.worktrees/tmp\nHEAD 123\ndetached\n";
        let parsed = parse_worktree_porcelain(out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].path, None);
        assert!(parsed[0].is_main);
        assert_eq!(parsed[0].branch, "main");
        assert_eq!(parsed[1].path.as_deref(), Some("/repo/.worktrees/feat-x"));
        assert_eq!(parsed[1].branch, "feat-x");
        assert!(!parsed[1].is_main);
    }
}
