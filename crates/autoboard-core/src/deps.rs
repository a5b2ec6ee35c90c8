use std::collections::HashMap;

use crate::types::{Feature, FeatureId};

/// A prerequisite that keeps a feature out of the schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockingDependency {
    /// Referenced id does not exist in the project.
    Missing(FeatureId),
    /// Exists but has not reached `completed` or `verified`.
    Unresolved(Feature),
}

impl BlockingDependency {
    pub fn id(&self) -> &str {
        match self {
            Self::Missing(id) => id,
            Self::Unresolved(f) => &f.id,
        }
    }
}

/// Prerequisites of `feature` that are not yet satisfied, in declaration order.
/// Always empty when dependency blocking is disabled for the project.
pub fn blocking_dependencies(
    feature: &Feature,
    all: &[Feature],
    enabled: bool,
) -> Vec<BlockingDependency> {
    if !enabled || feature.dependencies.is_empty() {
        return Vec::new();
    }
    let by_id: HashMap<&str, &Feature> = all.iter().map(|f| (f.id.as_str(), f)).collect();
    feature
        .dependencies
        .iter()
        .filter_map(|dep| match by_id.get(dep.as_str()) {
            None => Some(BlockingDependency::Missing(dep.clone())),
            Some(f) if !f.status.satisfies_dependents() => {
                Some(BlockingDependency::Unresolved((*f).clone()))
            }
            Some(_) => None,
        })
        .collect()
}

pub fn is_blocked(feature: &Feature, all: &[Feature], enabled: bool) -> bool {
    !blocking_dependencies(feature, all, enabled).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureStatus;

    #[test]
    fn no_dependencies_never_blocks() {
        let f = Feature::new("a", "A");
        assert!(blocking_dependencies(&f, &[f.clone()], true).is_empty());
    }

    #[test]
    fn missing_dependency_blocks() {
        let f = Feature::new("a", "A").with_dependencies(["ghost"]);
        let blocking = blocking_dependencies(&f, &[f.clone()], true);
        assert_eq!(blocking, vec![BlockingDependency::Missing("ghost".into())]);
    }

    #[test]
    fn unresolved_dependency_blocks_until_satisfied() {
        let dep = Feature::new("d", "D").with_status(FeatureStatus::InProgress);
        let f = Feature::new("a", "A").with_dependencies(["d"]);
        let all = vec![dep.clone(), f.clone()];
        let blocking = blocking_dependencies(&f, &all, true);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].id(), "d");

        for status in [FeatureStatus::Completed, FeatureStatus::Verified] {
            let all = vec![dep.clone().with_status(status), f.clone()];
            assert!(!is_blocked(&f, &all, true), "{status:?} should satisfy");
        }

        let waiting = vec![dep.with_status(FeatureStatus::WaitingApproval), f.clone()];
        assert!(is_blocked(&f, &waiting, true));
    }

    #[test]
    fn disabled_gate_returns_empty() {
        let f = Feature::new("a", "A").with_dependencies(["ghost"]);
        assert!(blocking_dependencies(&f, &[f.clone()], false).is_empty());
    }

    #[test]
    fn only_unsatisfied_are_reported_in_order() {
        let all = vec![
            Feature::new("x", "X").with_status(FeatureStatus::Completed),
            Feature::new("y", "Y"),
        ];
        let f = Feature::new("a", "A").with_dependencies(["y", "x", "z"]);
        let ids: Vec<_> = blocking_dependencies(&f, &all, true)
            .iter()
            .map(|b| b.id().to_string())
            .collect();
        assert_eq!(ids, vec!["y", "z"]);
    }
}
