//! # Typed Entity Model
//!
//! [`GenericTraitEntityModel`] reads and writes typed entities, addressing
//! them either by CIID or by identity.
//!
//! Entity types describing a singleton trait have no identity; they are
//! accessed through [`GenericTraitEntityModel::get_singleton`] and
//! [`GenericTraitEntityModel::set_singleton`] instead.

use super::{TraitEntityModel, WriteContext};
use crate::entity::{EntityFragments, EntityReflector, TraitEntity};
use crate::identity::{Identity, IdentityResolver};
use crate::schema::EffectiveTrait;
use crate::store::{AttributeSnapshot, CmdbStore};
use crate::types::{AttributeSelection, CiId, CiSelection, CmdbError, LayerSet, TimeThreshold};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Typed reads and writes of entity type `E`.
#[derive(Debug)]
pub struct GenericTraitEntityModel<E> {
    reflector: EntityReflector<E>,
    model: TraitEntityModel,
    resolver: Option<IdentityResolver>,
}

impl<E: TraitEntity> GenericTraitEntityModel<E> {
    /// Derive the schema of `E` and set up identity resolution.
    pub fn new() -> Result<Self, CmdbError> {
        let reflector = EntityReflector::<E>::new()?;
        let resolver = if reflector.is_singleton() {
            None
        } else {
            Some(IdentityResolver::new(reflector.schema())?)
        };
        let model = TraitEntityModel::new(Arc::clone(reflector.schema()));
        Ok(Self {
            reflector,
            model,
            resolver,
        })
    }

    pub fn reflector(&self) -> &EntityReflector<E> {
        &self.reflector
    }

    /// The untyped model over the same schema.
    pub fn model(&self) -> &TraitEntityModel {
        &self.model
    }

    fn invalid(&self, reason: &str) -> CmdbError {
        CmdbError::InvalidTrait {
            trait_id: self.reflector.trait_id().to_string(),
            reason: reason.to_string(),
        }
    }

    fn resolver(&self) -> Result<&IdentityResolver, CmdbError> {
        self.resolver
            .as_ref()
            .ok_or_else(|| self.invalid("singleton traits have no identity"))
    }

    fn require_singleton(&self) -> Result<(), CmdbError> {
        if self.reflector.is_singleton() {
            Ok(())
        } else {
            Err(self.invalid("trait is not a singleton"))
        }
    }

    /// The identity of `entity`.
    pub fn identity_of(&self, entity: &E) -> Result<Identity, CmdbError> {
        self.resolver()?.extract_identity(&self.reflector, entity)
    }

    fn decode(&self, effective: &EffectiveTrait) -> Result<E, CmdbError> {
        self.reflector.effective_to_entity(effective)
    }

    fn decode_all(
        &self,
        effective: BTreeMap<CiId, EffectiveTrait>,
    ) -> Result<BTreeMap<CiId, E>, CmdbError> {
        effective
            .into_iter()
            .map(|(ciid, et)| self.decode(&et).map(|entity| (ciid, entity)))
            .collect()
    }

    /// ID attributes of the CIs in `selection`.
    fn id_snapshot(
        &self,
        store: &impl CmdbStore,
        selection: &CiSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<AttributeSnapshot, CmdbError> {
        let names: AttributeSelection = self.resolver()?.id_attributes().iter().cloned().collect();
        store.get_merged_attributes(selection, &names, layers, time)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// The entity on `ciid`, or `None` if the CI does not conform.
    pub fn get_single_by_ciid(
        &self,
        store: &impl CmdbStore,
        ciid: CiId,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Option<E>, CmdbError> {
        self.model
            .get_by_ciid(store, ciid, layers, time)?
            .map(|et| self.decode(&et))
            .transpose()
    }

    /// Entities of every conformant CI in `selection`.
    pub fn get_by_selection(
        &self,
        store: &impl CmdbStore,
        selection: &CiSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<BTreeMap<CiId, E>, CmdbError> {
        let effective = self.model.get_by_selection(store, selection, layers, time)?;
        self.decode_all(effective)
    }

    /// The conformant CI with the lowest CIID carrying `identity`.
    pub fn get_by_data_id(
        &self,
        store: &impl CmdbStore,
        identity: &Identity,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Option<(CiId, E)>, CmdbError> {
        let snapshot = self.id_snapshot(store, &CiSelection::All, layers, time)?;
        let candidates = self.resolver()?.resolve_all(identity, &snapshot);
        if candidates.is_empty() {
            return Ok(None);
        }
        let selection: CiSelection = candidates.into_iter().collect();
        let found = self.get_by_selection(store, &selection, layers, time)?;
        Ok(found.into_iter().next())
    }

    /// Every conformant entity keyed by identity. When several CIs share an
    /// identity, the lowest CIID wins.
    pub fn get_all_by_data_id(
        &self,
        store: &impl CmdbStore,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<HashMap<Identity, (CiId, E)>, CmdbError> {
        let mut by_identity = HashMap::new();
        for (ciid, entity) in self.get_by_selection(store, &CiSelection::All, layers, time)? {
            let identity = self.identity_of(&entity)?;
            by_identity.entry(identity).or_insert((ciid, entity));
        }
        Ok(by_identity)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Write the fields present on `entity` to the CI carrying its identity,
    /// allocating a CI if there is none.
    ///
    /// Optional fields that are absent are left untouched on the CI.
    pub fn insert_or_update(
        &self,
        store: &mut impl CmdbStore,
        entity: &E,
        ctx: &WriteContext,
    ) -> Result<(E, bool), CmdbError> {
        let identity = self.identity_of(entity)?;
        let time = ctx.time_threshold();
        let snapshot = self.id_snapshot(store, &CiSelection::All, &ctx.read_layers, time)?;
        let ciid = match self.resolver()?.resolve(&identity, &snapshot) {
            Some(ciid) => ciid,
            None => store.create_ci()?,
        };
        let fragments = self.reflector.entity_to_fragments(entity, ciid)?;
        let (effective, changed) = self
            .model
            .insert_or_update(store, ciid, &fragments, None, ctx)?;
        Ok((self.decode(&effective)?, changed))
    }

    /// Make `entities` the complete set of entities within `selection`.
    ///
    /// Entities are matched to CIs in the selection by identity; unmatched
    /// ones get a fresh CI. Conformant CIs in the selection without a
    /// matching entity are cleared. Every trait field of every touched CI
    /// is replaced, so optional fields absent from an entity are removed.
    pub fn bulk_replace(
        &self,
        store: &mut impl CmdbStore,
        selection: &CiSelection,
        entities: &[E],
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let resolver = self.resolver()?;
        let mut identities = Vec::with_capacity(entities.len());
        let mut seen = HashSet::new();
        for entity in entities {
            let identity = resolver.extract_identity(&self.reflector, entity)?;
            if !seen.insert(identity.clone()) {
                return Err(CmdbError::DuplicateIdentity {
                    trait_id: self.reflector.trait_id().to_string(),
                    identity: identity.to_string(),
                });
            }
            identities.push(identity);
        }

        let time = ctx.time_threshold();
        let existing = self
            .model
            .get_by_selection(store, selection, &ctx.read_layers, time)?;
        if entities.is_empty() && existing.is_empty() {
            return Ok(false);
        }
        let snapshot = self.id_snapshot(store, selection, &ctx.read_layers, time)?;
        let matched = resolver.bulk_resolve(&identities, &snapshot);

        let mut written = Vec::with_capacity(entities.len());
        let mut created = 0usize;
        for (entity, identity) in entities.iter().zip(&identities) {
            let ciid = match matched.get(identity) {
                Some(ciid) => *ciid,
                None => {
                    created += 1;
                    store.create_ci()?
                }
            };
            let fragments: EntityFragments = self.reflector.entity_to_fragments(entity, ciid)?;
            written.push((ciid, fragments));
        }
        let targets: BTreeSet<CiId> = written.iter().map(|(ciid, _)| *ciid).collect();
        let orphans: BTreeSet<CiId> = existing
            .into_keys()
            .filter(|ciid| !targets.contains(ciid))
            .collect();

        let changed = self.model.replace_all(store, &written, &orphans, ctx)?;

        let written_cis: CiSelection = targets.iter().copied().collect();
        let conformant = self
            .model
            .get_by_selection(store, &written_cis, &ctx.read_layers, time)?;
        if let Some(ciid) = targets.iter().find(|ciid| !conformant.contains_key(ciid)) {
            return Err(CmdbError::NonConformant {
                trait_id: self.reflector.trait_id().to_string(),
                ciid: *ciid,
            });
        }
        tracing::debug!(
            trait_id = %self.reflector.trait_id(),
            entities = entities.len(),
            created,
            cleared = orphans.len(),
            changed,
            "bulk replace"
        );
        Ok(changed)
    }

    /// Delete the entity carrying `identity`.
    ///
    /// Returns `false` if no conformant CI carries it.
    pub fn try_to_delete(
        &self,
        store: &mut impl CmdbStore,
        identity: &Identity,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        let found = self.get_by_data_id(store, identity, &ctx.read_layers, ctx.time_threshold())?;
        match found {
            Some((ciid, _)) => self.model.try_to_delete(store, ciid, ctx),
            None => Ok(false),
        }
    }

    pub fn try_to_delete_by_ciid(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        self.model.try_to_delete(store, ciid, ctx)
    }

    /// Replace the related CIs of relation field `field`.
    pub fn set_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        field: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(E, bool), CmdbError> {
        let (effective, changed) = self.model.set_relations(store, ciid, field, related, ctx)?;
        Ok((self.decode(&effective)?, changed))
    }

    pub fn add_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        field: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(E, bool), CmdbError> {
        let (effective, changed) = self.model.add_relations(store, ciid, field, related, ctx)?;
        Ok((self.decode(&effective)?, changed))
    }

    pub fn remove_relations(
        &self,
        store: &mut impl CmdbStore,
        ciid: CiId,
        field: &str,
        related: &[CiId],
        ctx: &WriteContext,
    ) -> Result<(E, bool), CmdbError> {
        let (effective, changed) = self.model.remove_relations(store, ciid, field, related, ctx)?;
        Ok((self.decode(&effective)?, changed))
    }

    // =========================================================================
    // SINGLETONS
    // =========================================================================

    /// The singleton instance: the conformant CI with the lowest CIID among
    /// the CIs holding any attribute of the trait.
    pub fn get_singleton(
        &self,
        store: &impl CmdbStore,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Option<(CiId, E)>, CmdbError> {
        self.require_singleton()?;
        let names = self.model.schema().attribute_names();
        let selection = if names.is_empty() {
            CiSelection::All
        } else {
            let holding = store.get_merged_attributes(
                &CiSelection::All,
                &AttributeSelection::Named(names),
                layers,
                time,
            )?;
            if holding.is_empty() {
                return Ok(None);
            }
            holding.into_keys().collect::<CiSelection>()
        };
        Ok(self
            .get_by_selection(store, &selection, layers, time)?
            .into_iter()
            .next())
    }

    /// Replace the singleton instance with `entity`, allocating a CI if
    /// there is none yet.
    pub fn set_singleton(
        &self,
        store: &mut impl CmdbStore,
        entity: &E,
        ctx: &WriteContext,
    ) -> Result<(E, bool), CmdbError> {
        let time = ctx.time_threshold();
        let ciid = match self.get_singleton(store, &ctx.read_layers, time)? {
            Some((ciid, _)) => ciid,
            None => store.create_ci()?,
        };
        let fragments = self.reflector.entity_to_fragments(entity, ciid)?;
        let changed = self
            .model
            .replace_all(store, &[(ciid, fragments)], &BTreeSet::new(), ctx)?;
        let effective = self
            .model
            .get_by_ciid(store, ciid, &ctx.read_layers, time)?
            .ok_or_else(|| CmdbError::NonConformant {
                trait_id: self.reflector.trait_id().to_string(),
                ciid,
            })?;
        Ok((self.decode(&effective)?, changed))
    }

    /// Delete the singleton instance; `false` if there is none.
    pub fn delete_singleton(
        &self,
        store: &mut impl CmdbStore,
        ctx: &WriteContext,
    ) -> Result<bool, CmdbError> {
        match self.get_singleton(store, &ctx.read_layers, ctx.time_threshold())? {
            Some((ciid, _)) => self.model.try_to_delete(store, ciid, ctx),
            None => Ok(false),
        }
    }
}
