use std::collections::HashMap;

use crate::types::{Feature, FeatureId, FeaturePatch};

/// In-memory feature set for one project.
///
/// Two layers: the authoritative features (written by the reconciler and by
/// confirmed persistence writes) and a client-intent cache of optimistic
/// patches. Readers see intents overlaid on the authoritative value; any
/// authoritative write to a feature discards its intent.
///
/// The store does no locking of its own; the owning session serializes access.
#[derive(Debug, Default, Clone)]
pub struct FeatureStore {
    /// Insertion order is the scheduler's tie-break, so this stays a Vec.
    features: Vec<Feature>,
    intents: HashMap<FeatureId, FeaturePatch>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_features(features: impl IntoIterator<Item = Feature>) -> Self {
        let mut store = Self::new();
        for f in features {
            store.insert(f);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// All features in insertion order, with pending intents applied.
    pub fn list(&self) -> Vec<Feature> {
        self.features.iter().map(|f| self.overlay(f)).collect()
    }

    pub fn get(&self, id: &str) -> Option<Feature> {
        self.authoritative(id).map(|f| self.overlay(f))
    }

    /// The feature as last confirmed, ignoring optimistic intents.
    pub fn authoritative(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Insert or replace by id. A replaced feature keeps its position.
    pub fn insert(&mut self, feature: Feature) {
        self.intents.remove(&feature.id);
        match self.position(&feature.id) {
            Some(i) => self.features[i] = feature,
            None => self.features.push(feature),
        }
    }

    /// Apply an authoritative patch. Returns false if the feature is unknown.
    pub fn update(&mut self, id: &str, patch: &FeaturePatch) -> bool {
        let Some(i) = self.position(id) else {
            return false;
        };
        let mut next = self.features[i].clone();
        patch.apply(&mut next);
        self.features[i] = next;
        self.intents.remove(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Feature> {
        self.intents.remove(id);
        let i = self.position(id)?;
        Some(self.features.remove(i))
    }

    /// Record an optimistic patch on top of the authoritative feature.
    pub fn apply_intent(&mut self, id: &str, patch: FeaturePatch) -> bool {
        if !self.contains(id) {
            return false;
        }
        let entry = self.intents.entry(id.to_string()).or_default();
        merge_patch(entry, patch);
        true
    }

    pub fn clear_intent(&mut self, id: &str) -> Option<FeaturePatch> {
        self.intents.remove(id)
    }

    pub fn has_intent(&self, id: &str) -> bool {
        self.intents.contains_key(id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.features.iter().position(|f| f.id == id)
    }

    fn overlay(&self, feature: &Feature) -> Feature {
        let mut view = feature.clone();
        if let Some(intent) = self.intents.get(&feature.id) {
            intent.apply(&mut view);
        }
        view
    }
}

fn merge_patch(into: &mut FeaturePatch, from: FeaturePatch) {
    if from.status.is_some() {
        into.status = from.status;
    }
    if from.branch_name.is_some() {
        into.branch_name = from.branch_name;
    }
    if from.priority.is_some() {
        into.priority = from.priority;
    }
    if from.plan_spec.is_some() {
        into.plan_spec = from.plan_spec;
    }
    if from.error.is_some() {
        into.error = from.error;
    }
    if from.last_outcome.is_some() {
        into.last_outcome = from.last_outcome;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureStatus, PlanSpec, PlanStatus};

    fn store() -> FeatureStore {
        FeatureStore::from_features([
            Feature::new("a", "A").with_priority(2),
            Feature::new("b", "B"),
            Feature::new("c", "C").with_branch("main"),
        ])
    }

    #[test]
    fn list_keeps_insertion_order() {
        let ids: Vec<_> = store().list().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut s = store();
        s.insert(Feature::new("a", "A2"));
        let list = s.list();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].title, "A2");
        assert_eq!(list[0].priority, None);
    }

    #[test]
    fn update_unknown_is_noop() {
        let mut s = store();
        assert!(!s.update("zzz", &FeaturePatch::status(FeatureStatus::Verified)));
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn update_can_clear_optional_fields() {
        let mut s = store();
        let patch = FeaturePatch {
            branch_name: Some(None),
            ..Default::default()
        };
        assert!(s.update("c", &patch));
        assert_eq!(s.get("c").unwrap().branch_name, None);
    }

    #[test]
    fn intent_overlays_until_authoritative_write() {
        let mut s = store();
        let approve = FeaturePatch {
            plan_spec: Some(Some(PlanSpec {
                status: PlanStatus::Approved,
                content: "plan".into(),
                version: 1,
            })),
            ..Default::default()
        };
        assert!(s.apply_intent("b", approve));
        assert!(!s.get("b").unwrap().awaiting_plan_approval());
        assert_eq!(
            s.get("b").unwrap().plan_spec.unwrap().status,
            PlanStatus::Approved
        );
        assert!(s.authoritative("b").unwrap().plan_spec.is_none());

        // The reconciler wins: any authoritative write drops the intent.
        s.update("b", &FeaturePatch::status(FeatureStatus::InProgress));
        assert!(!s.has_intent("b"));
        let b = s.get("b").unwrap();
        assert!(b.plan_spec.is_none());
        assert_eq!(b.status, FeatureStatus::InProgress);
    }

    #[test]
    fn intents_merge_field_by_field() {
        let mut s = store();
        s.apply_intent("a", FeaturePatch::status(FeatureStatus::Verified));
        s.apply_intent(
            "a",
            FeaturePatch {
                priority: Some(Some(9)),
                ..Default::default()
            },
        );
        let a = s.get("a").unwrap();
        assert_eq!(a.status, FeatureStatus::Verified);
        assert_eq!(a.priority, Some(9));
    }

    #[test]
    fn intent_on_missing_feature_is_rejected() {
        let mut s = store();
        assert!(!s.apply_intent("nope", FeaturePatch::status(FeatureStatus::Verified)));
    }

    #[test]
    fn remove_drops_feature_and_intent() {
        let mut s = store();
        s.apply_intent("a", FeaturePatch::status(FeatureStatus::Verified));
        assert!(s.remove("a").is_some());
        assert!(!s.has_intent("a"));
        assert!(s.get("a").is_none());
    }
}
