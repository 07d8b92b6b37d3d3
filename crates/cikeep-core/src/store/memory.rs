//! In-memory reference store.
//!
//! Keeps the full revision history of every attribute and relation in
//! ordered maps. Deterministic: iteration is always in key order.

use super::history::{
    AttributeHistory, RelationHistory, RelationMark, merge_attributes, merge_relations,
};
use super::{
    AttributeSnapshot, AttributeStore, CiStore, MaskHandlingForRemoval, MergedRelation,
    OtherLayersValueHandling, Relation, RelationSelection, RelationStore,
};
use crate::types::{
    AttributeSelection, ChangesetProxy, CiId, CiSelection, CmdbError, LayerId, LayerSet,
    TimeThreshold,
};
use crate::value::AttributeValue;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    cis: BTreeSet<CiId>,
    attributes: AttributeHistory,
    relations: RelationHistory,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a CI with a caller-chosen id; returns false if it existed.
    pub fn insert_ci(&mut self, ciid: CiId) -> bool {
        self.cis.insert(ciid)
    }

    fn require_ci(&self, ciid: CiId) -> Result<(), CmdbError> {
        if self.cis.contains(&ciid) {
            Ok(())
        } else {
            Err(CmdbError::Storage(format!("unknown CI {ciid}")))
        }
    }
}

impl CiStore for MemoryStore {
    fn create_ci(&mut self) -> Result<CiId, CmdbError> {
        loop {
            let ciid = CiId::new_random();
            if self.cis.insert(ciid) {
                tracing::debug!(%ciid, "CI created");
                return Ok(ciid);
            }
        }
    }

    fn get_ciids(&self, selection: &CiSelection) -> Result<Vec<CiId>, CmdbError> {
        Ok(match selection {
            CiSelection::All => self.cis.iter().copied().collect(),
            CiSelection::Specific(wanted) => self.cis.intersection(wanted).copied().collect(),
        })
    }
}

impl AttributeStore for MemoryStore {
    fn insert_attribute(
        &mut self,
        name: &str,
        value: AttributeValue,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError> {
        self.require_ci(ciid)?;
        let key = (ciid, name.to_string());
        let Some(revision) = self
            .attributes
            .plan_insert(&key, value, layer, changeset, other_layers)
        else {
            return Ok(false);
        };
        tracing::debug!(%ciid, name, %layer, "attribute written");
        self.attributes.push(key, layer.clone(), revision);
        Ok(true)
    }

    fn remove_attribute(
        &mut self,
        name: &str,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError> {
        self.require_ci(ciid)?;
        let key = (ciid, name.to_string());
        let Some(revision) = self
            .attributes
            .plan_remove(&key, layer, changeset, mask_handling)
        else {
            return Ok(false);
        };
        tracing::debug!(%ciid, name, %layer, masked = revision.state.is_some(), "attribute removed");
        self.attributes.push(key, layer.clone(), revision);
        Ok(true)
    }

    fn get_merged_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<AttributeSnapshot, CmdbError> {
        let snapshot = match cis {
            CiSelection::All => {
                merge_attributes(&self.attributes, self.attributes.keys(), attributes, layers, time)
            }
            CiSelection::Specific(wanted) => {
                let keys = wanted.iter().flat_map(|ciid| {
                    self.attributes
                        .keys_from((*ciid, String::new()))
                        .take_while(move |(c, _)| c == ciid)
                });
                merge_attributes(&self.attributes, keys, attributes, layers, time)
            }
        };
        Ok(snapshot)
    }
}

impl RelationStore for MemoryStore {
    fn insert_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError> {
        self.require_ci(relation.from)?;
        self.require_ci(relation.to)?;
        let Some(revision) =
            self.relations
                .plan_insert(relation, RelationMark::Live, layer, changeset, other_layers)
        else {
            return Ok(false);
        };
        tracing::debug!(from = %relation.from, to = %relation.to, predicate = %relation.predicate, %layer, "relation written");
        self.relations.push(relation.clone(), layer.clone(), revision);
        Ok(true)
    }

    fn remove_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError> {
        let Some(revision) = self
            .relations
            .plan_remove(relation, layer, changeset, mask_handling)
        else {
            return Ok(false);
        };
        tracing::debug!(from = %relation.from, to = %relation.to, predicate = %relation.predicate, %layer, "relation removed");
        self.relations.push(relation.clone(), layer.clone(), revision);
        Ok(true)
    }

    fn get_merged_relations(
        &self,
        selection: &RelationSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Vec<MergedRelation>, CmdbError> {
        Ok(merge_relations(&self.relations, selection, layers, time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttributeFragment, BulkAttributeScope, BulkRelationScope};
    use crate::types::RelationDirection;
    use chrono::Duration;

    fn layers(names: &[&str]) -> LayerSet {
        LayerSet::new(names.iter().map(|n| LayerId::new(*n)).collect()).expect("layers")
    }

    fn read_name(store: &MemoryStore, ciid: CiId, read: &LayerSet) -> Option<AttributeValue> {
        let snapshot = store
            .get_merged_attributes(
                &CiSelection::single(ciid),
                &AttributeSelection::All,
                read,
                TimeThreshold::Latest,
            )
            .expect("read");
        snapshot
            .get(&ciid)
            .and_then(|attrs| attrs.get("name"))
            .map(|m| m.value.clone())
    }

    #[test]
    fn writes_to_unknown_ci_fail() {
        let mut store = MemoryStore::new();
        let result = store.insert_attribute(
            "name",
            AttributeValue::text("x"),
            CiId::from_u128(1),
            &LayerId::new("l"),
            &ChangesetProxy::now(),
            &OtherLayersValueHandling::ForceWrite,
        );
        assert!(matches!(result, Err(CmdbError::Storage(_))));
    }

    #[test]
    fn insert_reports_change_once() {
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        let layer = LayerId::new("l");
        let cs = ChangesetProxy::now();
        let write = |store: &mut MemoryStore| {
            store
                .insert_attribute(
                    "name",
                    AttributeValue::text("x"),
                    ci,
                    &layer,
                    &cs,
                    &OtherLayersValueHandling::ForceWrite,
                )
                .expect("insert")
        };
        assert!(write(&mut store));
        assert!(!write(&mut store));
    }

    #[test]
    fn removal_masks_base_layer() {
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        let read = layers(&["top", "base"]);
        let cs = ChangesetProxy::now();
        store
            .insert_attribute(
                "name",
                AttributeValue::text("base"),
                ci,
                &LayerId::new("base"),
                &cs,
                &OtherLayersValueHandling::ForceWrite,
            )
            .expect("insert");
        assert_eq!(read_name(&store, ci, &read), Some(AttributeValue::text("base")));

        let removed = store
            .remove_attribute(
                "name",
                ci,
                &LayerId::new("top"),
                &cs,
                &MaskHandlingForRemoval::ApplyMaskIfNecessary(read.clone()),
            )
            .expect("remove");
        assert!(removed);
        assert_eq!(read_name(&store, ci, &read), None);
        assert_eq!(
            read_name(&store, ci, &layers(&["base"])),
            Some(AttributeValue::text("base"))
        );
    }

    #[test]
    fn reads_travel_in_time() {
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        let layer = LayerId::new("l");
        let first = ChangesetProxy::now();
        let second = ChangesetProxy::new(first.timestamp() + Duration::seconds(1));
        for (cs, value) in [(&first, "one"), (&second, "two")] {
            store
                .insert_attribute(
                    "name",
                    AttributeValue::text(value),
                    ci,
                    &layer,
                    cs,
                    &OtherLayersValueHandling::ForceWrite,
                )
                .expect("insert");
        }
        let at_first = store
            .get_merged_attributes(
                &CiSelection::All,
                &AttributeSelection::All,
                &LayerSet::single(layer),
                first.time_threshold(),
            )
            .expect("read");
        assert_eq!(at_first[&ci]["name"].value, AttributeValue::text("one"));
        assert_eq!(at_first[&ci]["name"].changeset, first.id());
    }

    #[test]
    fn bulk_replace_attributes_removes_unlisted() {
        let mut store = MemoryStore::new();
        let a = store.create_ci().expect("ci");
        let b = store.create_ci().expect("ci");
        let layer = LayerId::new("l");
        let read = LayerSet::single(layer.clone());
        let cs = ChangesetProxy::now();
        for ci in [a, b] {
            store
                .insert_attribute(
                    "name",
                    AttributeValue::text("old"),
                    ci,
                    &layer,
                    &cs,
                    &OtherLayersValueHandling::ForceWrite,
                )
                .expect("insert");
        }
        let scope = BulkAttributeScope {
            layer: layer.clone(),
            fragments: vec![AttributeFragment::new(a, "name", AttributeValue::text("new"))],
            relevant_cis: BTreeSet::from([a, b]),
            relevant_names: BTreeSet::from(["name".to_string()]),
        };
        let changed = store
            .bulk_replace_attributes(
                &scope,
                &cs,
                &MaskHandlingForRemoval::ApplyNoMask,
                &OtherLayersValueHandling::ForceWrite,
            )
            .expect("bulk");
        assert_eq!(changed, 2);
        assert_eq!(read_name(&store, a, &read), Some(AttributeValue::text("new")));
        assert_eq!(read_name(&store, b, &read), None);
    }

    #[test]
    fn bulk_scope_rejects_outside_fragments() {
        let mut store = MemoryStore::new();
        let a = store.create_ci().expect("ci");
        let scope = BulkAttributeScope {
            layer: LayerId::new("l"),
            fragments: vec![AttributeFragment::new(a, "other", AttributeValue::Integer(1))],
            relevant_cis: BTreeSet::from([a]),
            relevant_names: BTreeSet::from(["name".to_string()]),
        };
        let result = store.bulk_replace_attributes(
            &scope,
            &ChangesetProxy::now(),
            &MaskHandlingForRemoval::ApplyNoMask,
            &OtherLayersValueHandling::ForceWrite,
        );
        assert!(result.is_err());
    }

    #[test]
    fn relations_merge_and_bulk_replace() {
        let mut store = MemoryStore::new();
        let app = store.create_ci().expect("ci");
        let old_host = store.create_ci().expect("ci");
        let new_host = store.create_ci().expect("ci");
        let layer = LayerId::new("l");
        let read = LayerSet::single(layer.clone());
        let cs = ChangesetProxy::now();
        store
            .insert_relation(
                &Relation::new(app, old_host, "runs_on"),
                &layer,
                &cs,
                &OtherLayersValueHandling::ForceWrite,
            )
            .expect("insert");

        let scope = BulkRelationScope {
            layer: layer.clone(),
            direction: RelationDirection::Forward,
            fragments: vec![Relation::new(app, new_host, "runs_on")],
            relevant: BTreeSet::from([(app, "runs_on".to_string())]),
        };
        let changed = store
            .bulk_replace_relations(
                &scope,
                &cs,
                &MaskHandlingForRemoval::ApplyNoMask,
                &OtherLayersValueHandling::ForceWrite,
            )
            .expect("bulk");
        assert_eq!(changed, 2);

        let merged = store
            .get_merged_relations(
                &RelationSelection::From(BTreeSet::from([app])),
                &read,
                TimeThreshold::Latest,
            )
            .expect("relations");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].relation.to, new_host);

        let incoming = store
            .get_merged_relations(
                &RelationSelection::To(BTreeSet::from([old_host])),
                &read,
                TimeThreshold::Latest,
            )
            .expect("relations");
        assert!(incoming.is_empty());
    }
}
