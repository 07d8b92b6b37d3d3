//! # Trait Entity Model
//!
//! Reads and writes trait-conformant data against the storage traits.
//!
//! [`TraitEntityModel`] works on a [`TraitSchema`] and generic CI data
//! ([`EntityFragments`], [`EffectiveTrait`]).
//! [`GenericTraitEntityModel`] layers typed entities and identity
//! resolution on top of it.
//!
//! ## Conformance
//!
//! Conformance is never stored. Every write is followed by a read of the
//! merged view at the changeset's time threshold; a write that leaves the
//! addressed CI non-conformant fails with [`CmdbError::NonConformant`].
//! Deletion is defined by effect: it succeeds when the CI no longer
//! conforms afterwards.

pub mod generic;

pub use generic::GenericTraitEntityModel;

use crate::entity::{EntityFragments, RelationFragment};
use crate::primitives::NAME_ATTRIBUTE;
use crate::schema::{EffectiveTrait, TraitSchema};
use crate::store::{
    AttributeFragment, BulkAttributeScope, BulkRelationScope, CmdbStore, MaskHandlingForRemoval,
    OtherLayersValueHandling, Relation, RelationSelection,
};
use crate::types::{
    AttributeSelection, ChangesetProxy, CiId, CiSelection, CmdbError, LayerId, LayerSet,
    RelationDirection, TimeThreshold,
};
use crate::value::AttributeValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// WRITE CONTEXT
// =============================================================================

/// Everything a write needs besides the data.
///
/// `write_layer` should be part of `read_layers`, otherwise the
/// conformance check after a write cannot observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub read_layers: LayerSet,
    pub write_layer: LayerId,
    pub changeset: ChangesetProxy,
    pub mask_handling: MaskHandlingForRemoval,
    pub other_layers: OtherLayersValueHandling,
}

impl WriteContext {
    /// Context masking lower layers where needed and skipping writes the
    /// lower layers already satisfy.
    pub fn new(read_layers: LayerSet, write_layer: LayerId, changeset: ChangesetProxy) -> Self {
        Self {
            mask_handling: MaskHandlingForRemoval::ApplyMaskIfNecessary(read_layers.clone()),
            other_layers: OtherLayersValueHandling::TakeIntoAccount(read_layers.clone()),
            read_layers,
            write_layer,
            changeset,
        }
    }

    pub fn with_mask_handling(mut self, mask_handling: MaskHandlingForRemoval) -> Self {
        self.mask_handling = mask_handling;
        self
    }

    pub fn with_other_layers(mut self, other_layers: OtherLayersValueHandling) -> Self {
        self.other_layers = other_layers;
        self
    }

    /// Reads on behalf of this write observe the state as of the changeset.
    pub fn time_threshold(&self) -> TimeThreshold {
        self.changeset.time_threshold()
    }
}

// =============================================================================
// DYNAMIC MODEL
// =============================================================================

/// Trait-conformant reads and writes over one [`TraitSchema`].
#[derive(Debug, Clone)]
pub struct TraitEntityModel {
    schema: Arc<TraitSchema>,
}

impl TraitEntityModel {
    pub fn new(schema: Arc<TraitSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<TraitSchema> {
        &self.schema
    }

    fn relevant_attributes(&self) -> AttributeSelection {
        AttributeSelection::Named(self.schema.attribute_names())
    }

    fn non_conformant(&self, ciid: CiId) -> CmdbError {
        CmdbError::NonConformant {
            trait_id: self.schema.id().to_string(),
            ciid,
        }
    }

    /// The effective trait of `ciid`, or `None` if it does not conform.
    pub fn get_by_ciid(
        &self,
        store: &impl CmdbStore,
        ciid: CiId,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Option<EffectiveTrait>, CmdbError> {
        let mut found = self.get_by_selection(store, &CiSelection::single(ciid), layers, time)?;
        Ok(found.remove(&ciid))
    }

    /// Effective traits of every conformant CI in `selection`.
    pub fn get_by_selection(
        &self,
        store: &impl CmdbStore,
        selection: &CiSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<BTreeMap<CiId, EffectiveTrait>, CmdbError> {
        let candidates = store.get_ciids(selection)?;
        if candidates.is_empty() {
            return Ok(BTreeMap::new());
        }
        let attributes =
            store.get_merged_attributes(selection, &self.relevant_attributes(), layers, time)?;
        let relations = if self.schema.relations().next().is_some() {
            store.get_merged_relations(&RelationSelection::for_ci_selection(selection), layers, time)?
        } else {
            Vec::new()
        };
        let effective = self
            .schema
            .resolve_effective_many(candidates, &attributes, &relations);
        tracing::debug!(
            trait_id = %self.schema.id(),
            conformant = effective.len(),
            "effective traits resolved"
        );
        Ok(effective)
    }

    /// Write the fields present in `fragments` to `ciid`.
    ///
    /// Only the attributes and relation fields listed are touched; fields
    /// left out keep their current state. With `ci_name`, the reserved name
    /// attribute is written as well. Fails if the CI does not conform
    /// afterwards.
    pub fn insert_or_update(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        fragments: &EntityFragments,
        ci_name: Option<&str>,
        ctx: &WriteContext,
    ) -> Result<(EffectiveTrait, bool), CmdbError> {
        let mut attributes = fragments.attributes.clone();
        if let Some(name) = ci_name {
            attributes.push(AttributeFragment::new(
                ciid,
                NAME_ATTRIBUTE,
                AttributeValue::text(name),
            ));
        }
        let names = attributes.iter().map(|f| f.name.clone()).collect();
        let mut changed = self.write_attributes(store, BTreeSet::from([ciid]), names, attributes, ctx)?;

        let anchored: Vec<(CiId, &RelationFragment)> =
            fragments.relations.iter().map(|r| (ciid, r)).collect();
        changed |= self.write_relations(store, &anchored, &anchored, ctx)?;

        let effective = self
            .get_by_ciid(store, ciid, &ctx.read_layers, ctx.time_threshold())?
            .ok_or_else(|| self.non_conformant(ciid))?;
        tracing::debug!(trait_id = %self.schema.id(), %ciid, changed, "trait entity written");
        Ok((effective, changed))
    }

    /// Make the trait data of each CI in `entities` exactly its fragments
    /// and clear the trait data of `cleared`.
    ///
    /// Every trait attribute and relation field of every listed CI is in
    /// scope, so fields absent from an entity are removed.
    pub(crate) fn replace_all(
        &self,
        store: &mut impl CmdbStore,
        entities: &[(CiId, EntityFragments)],
        cleared: &BTreeSet<CiId>,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let relevant: BTreeSet<CiId> = entities
            .iter()
            .map(|(ciid, _)| *ciid)
            .chain(cleared.iter().copied())
            .collect();
        if relevant.is_empty() {
            return Ok(false);
        }
        let attributes = entities
            .iter()
            .flat_map(|(_, fragments)| fragments.attributes.iter().cloned())
            .collect();
        let mut changed = self.write_attributes(
            store,
            relevant.clone(),
            self.schema.attribute_names(),
            attributes,
            ctx,
        )?;

        let written: Vec<(CiId, &RelationFragment)> = entities
            .iter()
            .flat_map(|(ciid, fragments)| fragments.relations.iter().map(move |r| (*ciid, r)))
            .collect();
        changed |= self.clear_relations_and_write(store, &relevant, &written, ctx)?;
        Ok(changed)
    }

    /// Remove every attribute and relation field of the trait, plus the
    /// reserved name attribute, from `ciid`.
    ///
    /// Returns `false` when the CI did not conform to begin with, otherwise
    /// whether it no longer conforms afterwards.
    pub fn try_to_delete(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let time = ctx.time_threshold();
        if self.get_by_ciid(store, ciid, &ctx.read_layers, time)?.is_none() {
            return Ok(false);
        }

        let mut names = self.schema.attribute_names();
        names.insert(NAME_ATTRIBUTE.to_string());
        self.write_attributes(store, BTreeSet::from([ciid]), names, Vec::new(), ctx)?;
        self.clear_relations_and_write(store, &BTreeSet::from([ciid]), &[], ctx)?;

        let deleted = self.get_by_ciid(store, ciid, &ctx.read_layers, time)?.is_none();
        tracing::debug!(trait_id = %self.schema.id(), %ciid, deleted, "trait entity deleted");
        Ok(deleted)
    }

    /// Replace the related CIs of relation field `identifier` of `ciid`.
    pub fn set_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        identifier: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(EffectiveTrait, bool), CmdbError> {
        let fragment = self.relation_fragment(identifier, related)?;
        let anchored = [(ciid, &fragment)];
        let changed = self.write_relations(store, &anchored, &anchored, ctx)?;
        self.reread(store, ciid, changed, ctx)
    }

    /// Add related CIs to relation field `identifier` of `ciid`.
    pub fn add_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        identifier: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(EffectiveTrait, bool), CmdbError> {
        let fragment = self.relation_fragment(identifier, related)?;
        let mut changed = false;
        for relation in fragment.relations(ciid) {
            changed |= store.insert_relation(
                &relation,
                &ctx.write_layer,
                &ctx.changeset,
                &ctx.other_layers,
            )?;
        }
        self.reread(store, ciid, changed, ctx)
    }

    /// Remove related CIs from relation field `identifier` of `ciid`.
    pub fn remove_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        identifier: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(EffectiveTrait, bool), CmdbError> {
        let fragment = self.relation_fragment(identifier, related)?;
        let mut changed = false;
        for relation in fragment.relations(ciid) {
            changed |= store.remove_relation(
                &relation,
                &ctx.write_layer,
                &ctx.changeset,
                &ctx.mask_handling,
            )?;
        }
        self.reread(store, ciid, changed, ctx)
    }

    fn relation_fragment(
        &self,
        identifier: &str,
        related: &[CiId],
    ) -> Result<RelationFragment, CmdbError> {
        let relation = self.schema.find_relation(identifier).ok_or_else(|| {
            CmdbError::UnknownRelationField {
                trait_id: self.schema.id().to_string(),
                field: identifier.to_string(),
            }
        })?;
        let mut targets = related.to_vec();
        targets.sort();
        targets.dedup();
        Ok(RelationFragment {
            identifier: relation.identifier.clone(),
            predicate_id: relation.template.predicate_id.clone(),
            direction: relation.template.direction,
            targets,
        })
    }

    fn reread(
        &self,
        store: &impl CmdbStore,
        ciid: CiId,
        changed: bool,
        ctx: &WriteContext,
    ) -> Result<(EffectiveTrait, bool), CmdbError> {
        let effective = self
            .get_by_ciid(store, ciid, &ctx.read_layers, ctx.time_threshold())?
            .ok_or_else(|| self.non_conformant(ciid))?;
        Ok((effective, changed))
    }

    fn write_attributes(
        &self,
        store: &mut impl CmdbStore,
        relevant_cis: BTreeSet<CiId>,
        relevant_names: BTreeSet<String>,
        fragments: Vec<AttributeFragment>,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let scope = BulkAttributeScope {
            layer: ctx.write_layer.clone(),
            fragments,
            relevant_cis,
            relevant_names,
        };
        let changed = store.bulk_replace_attributes(
            &scope,
            &ctx.changeset,
            &ctx.mask_handling,
            &ctx.other_layers,
        )?;
        Ok(changed > 0)
    }

    /// Bring the relation fields named by `scoped` in line with `written`.
    fn write_relations(
        &self,
        store: &mut impl CmdbStore,
        scoped: &[(CiId, &RelationFragment)],
        written: &[(CiId, &RelationFragment)],
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let mut changed = false;
        for direction in [RelationDirection::Forward, RelationDirection::Back] {
            let relevant: BTreeSet<(CiId, String)> = scoped
                .iter()
                .filter(|(_, fragment)| fragment.direction == direction)
                .map(|(ciid, fragment)| (*ciid, fragment.predicate_id.clone()))
                .collect();
            if relevant.is_empty() {
                continue;
            }
            let fragments: Vec<Relation> = written
                .iter()
                .filter(|(_, fragment)| fragment.direction == direction)
                .flat_map(|(ciid, fragment)| fragment.relations(*ciid))
                .collect();
            let scope = BulkRelationScope {
                layer: ctx.write_layer.clone(),
                direction,
                fragments,
                relevant,
            };
            changed |= store.bulk_replace_relations(
                &scope,
                &ctx.changeset,
                &ctx.mask_handling,
                &ctx.other_layers,
            )? > 0;
        }
        Ok(changed)
    }

    /// Scope every relation field of the trait on `cis` and write `written`.
    fn clear_relations_and_write(
        &self,
        store: &mut impl CmdbStore,
        cis: &BTreeSet<CiId>,
        written: &[(CiId, &RelationFragment)],
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let all_fields: Vec<RelationFragment> = self
            .schema
            .relations()
            .map(|(relation, _)| RelationFragment {
                identifier: relation.identifier.clone(),
                predicate_id: relation.template.predicate_id.clone(),
                direction: relation.template.direction,
                targets: Vec::new(),
            })
            .collect();
        let scoped: Vec<(CiId, &RelationFragment)> = cis
            .iter()
            .flat_map(|ciid| all_fields.iter().map(move |f| (*ciid, f)))
            .collect();
        self.write_relations(store, &scoped, written, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CiAttributeTemplate, RelationTemplate};
    use crate::store::{AttributeStore, CiStore, MemoryStore, RelationStore};
    use crate::value::AttributeValueType;
    use chrono::{Duration, TimeZone, Utc};

    fn schema() -> Arc<TraitSchema> {
        Arc::new(
            TraitSchema::builder("app")
                .required_attribute(
                    "name",
                    CiAttributeTemplate::new("app.name", AttributeValueType::Text, false).id(),
                )
                .optional_attribute(
                    "port",
                    CiAttributeTemplate::new("app.port", AttributeValueType::Integer, false),
                )
                .optional_relation(
                    "host",
                    RelationTemplate::new("runs_on", RelationDirection::Forward)
                        .with_cardinality(None, Some(1)),
                )
                .build()
                .expect("schema"),
        )
    }

    fn ctx(seconds: i64) -> WriteContext {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("time");
        WriteContext::new(
            LayerSet::single(LayerId::new("main")),
            LayerId::new("main"),
            ChangesetProxy::new(base + Duration::seconds(seconds)),
        )
    }

    fn fragments(ciid: CiId, name: &str, port: Option<i64>) -> EntityFragments {
        let mut attributes = vec![AttributeFragment::new(ciid, "app.name", AttributeValue::text(name))];
        if let Some(port) = port {
            attributes.push(AttributeFragment::new(ciid, "app.port", AttributeValue::Integer(port)));
        }
        EntityFragments {
            attributes,
            relations: Vec::new(),
        }
    }

    #[test]
    fn write_context_defaults_follow_read_layers() {
        let ctx = ctx(0);
        assert_eq!(
            ctx.mask_handling,
            MaskHandlingForRemoval::ApplyMaskIfNecessary(ctx.read_layers.clone())
        );
        assert!(matches!(ctx.time_threshold(), TimeThreshold::At(_)));
    }

    #[test]
    fn insert_then_patch_keeps_unlisted_fields() {
        let model = TraitEntityModel::new(schema());
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");

        let (effective, changed) = model
            .insert_or_update(&mut store, ci, &fragments(ci, "web", Some(80)), Some("Web"), &ctx(1))
            .expect("insert");
        assert!(changed);
        assert_eq!(effective.attribute_value("port"), Some(&AttributeValue::Integer(80)));

        let (effective, changed) = model
            .insert_or_update(&mut store, ci, &fragments(ci, "web", None), None, &ctx(2))
            .expect("patch");
        assert!(!changed);
        assert_eq!(effective.attribute_value("port"), Some(&AttributeValue::Integer(80)));
    }

    #[test]
    fn write_leaving_ci_non_conformant_fails() {
        let model = TraitEntityModel::new(schema());
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        let only_port = EntityFragments {
            attributes: vec![AttributeFragment::new(ci, "app.port", AttributeValue::Integer(1))],
            relations: Vec::new(),
        };
        let result = model.insert_or_update(&mut store, ci, &only_port, None, &ctx(1));
        assert!(matches!(result, Err(CmdbError::NonConformant { .. })));
    }

    #[test]
    fn delete_is_defined_by_effect() {
        let model = TraitEntityModel::new(schema());
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        model
            .insert_or_update(&mut store, ci, &fragments(ci, "web", Some(80)), Some("Web"), &ctx(1))
            .expect("insert");

        assert!(model.try_to_delete(&mut store, ci, &ctx(2)).expect("delete"));
        assert!(!model.try_to_delete(&mut store, ci, &ctx(3)).expect("delete again"));

        let names = store
            .get_merged_attributes(
                &CiSelection::single(ci),
                &AttributeSelection::All,
                &LayerSet::single(LayerId::new("main")),
                TimeThreshold::Latest,
            )
            .expect("read");
        assert!(names.get(&ci).is_none_or(BTreeMap::is_empty));

        // The state before the deletion stays readable.
        let before = model
            .get_by_ciid(&store, ci, &LayerSet::single(LayerId::new("main")), ctx(1).time_threshold())
            .expect("read");
        assert!(before.is_some());
    }

    #[test]
    fn relation_mutations() {
        let model = TraitEntityModel::new(schema());
        let mut store = MemoryStore::new();
        let ci = store.create_ci().expect("ci");
        let host_a = store.create_ci().expect("ci");
        let host_b = store.create_ci().expect("ci");
        model
            .insert_or_update(&mut store, ci, &fragments(ci, "web", None), None, &ctx(1))
            .expect("insert");

        let (effective, changed) = model
            .add_relations(&mut store, ci, "host", &[host_a], &ctx(2))
            .expect("add");
        assert!(changed);
        assert_eq!(effective.related("host"), &[host_a]);

        let (effective, _) = model
            .set_relations(&mut store, ci, "host", &[host_b], &ctx(3))
            .expect("set");
        assert_eq!(effective.related("host"), &[host_b]);

        // Two hosts exceed the cardinality; the optional field is dropped.
        let (effective, _) = model
            .add_relations(&mut store, ci, "host", &[host_a], &ctx(4))
            .expect("add");
        assert!(effective.relations.get("host").is_none());

        let (effective, changed) = model
            .remove_relations(&mut store, ci, "host", &[host_a, host_b], &ctx(5))
            .expect("remove");
        assert!(changed);
        assert!(effective.related("host").is_empty());
        let left = store
            .get_merged_relations(
                &RelationSelection::From(BTreeSet::from([ci])),
                &LayerSet::single(LayerId::new("main")),
                TimeThreshold::Latest,
            )
            .expect("relations");
        assert!(left.is_empty());

        assert!(matches!(
            model.set_relations(&mut store, ci, "nope", &[], &ctx(6)),
            Err(CmdbError::UnknownRelationField { .. })
        ));
    }
}
