//! # Storage Collaborators
//!
//! The layered, changeset-versioned attribute/relation storage the trait
//! model is written against.
//!
//! The model only ever talks to the [`CiStore`], [`AttributeStore`] and
//! [`RelationStore`] traits. Two implementations ship with the crate:
//! - [`MemoryStore`]: in-memory reference implementation
//! - [`RedbStore`]: persistent implementation on redb
//!
//! ## Merge Semantics
//!
//! Every write appends a revision for one (CI, attribute, layer) or
//! (relation, layer) key, stamped with the changeset id and timestamp. A
//! read at a [`TimeThreshold`] sees, per layer, the latest revision written
//! at or before the threshold. The first layer of the [`LayerSet`] holding
//! a live state wins; a Mask state hides the key entirely.

mod history;
pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use crate::types::{
    AttributeSelection, ChangesetId, ChangesetProxy, CiId, CiSelection, CmdbError, LayerId,
    LayerSet, RelationDirection, TimeThreshold,
};
use crate::value::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// DATA TYPES
// =============================================================================

/// A directed, predicate-labelled edge between two CIs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub from: CiId,
    pub to: CiId,
    pub predicate: String,
}

impl Relation {
    pub fn new(from: CiId, to: CiId, predicate: impl Into<String>) -> Self {
        Self {
            from,
            to,
            predicate: predicate.into(),
        }
    }

    /// The endpoint a trait in `direction` is anchored on.
    pub fn anchor(&self, direction: RelationDirection) -> CiId {
        match direction {
            RelationDirection::Forward => self.from,
            RelationDirection::Back => self.to,
        }
    }
}

/// An attribute as seen through a layer set.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedAttribute {
    pub ciid: CiId,
    pub name: String,
    pub value: AttributeValue,
    /// Layers holding a state for the attribute, highest precedence first.
    pub layer_stack: Vec<LayerId>,
    /// Changeset of the winning revision.
    pub changeset: ChangesetId,
}

/// A relation as seen through a layer set.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRelation {
    pub relation: Relation,
    pub layer_stack: Vec<LayerId>,
    pub changeset: ChangesetId,
}

/// One attribute value to be written for one CI.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFragment {
    pub ciid: CiId,
    pub name: String,
    pub value: AttributeValue,
}

impl AttributeFragment {
    pub fn new(ciid: CiId, name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            ciid,
            name: name.into(),
            value,
        }
    }
}

/// Merged attributes per CI, keyed by attribute name.
pub type AttributeSnapshot = BTreeMap<CiId, BTreeMap<String, MergedAttribute>>;

// =============================================================================
// WRITE POLICIES
// =============================================================================

/// How removals treat values in lower layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskHandlingForRemoval {
    /// Remove the write layer's state only.
    ApplyNoMask,
    /// Write a Mask when a lower layer of the given read set would
    /// otherwise still provide the value.
    ApplyMaskIfNecessary(LayerSet),
}

/// How writes treat values already provided by other layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtherLayersValueHandling {
    /// Skip a write when the write layer holds nothing and the lower layers
    /// of the given read set already provide the same value.
    TakeIntoAccount(LayerSet),
    /// Always write.
    ForceWrite,
}

// =============================================================================
// SCOPES & SELECTIONS
// =============================================================================

/// A bulk attribute replacement.
///
/// Within one layer, the attributes named in `relevant_names` of the CIs in
/// `relevant_cis` end up exactly as given by `fragments`: listed ones are
/// written, all others are removed.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAttributeScope {
    pub layer: LayerId,
    pub fragments: Vec<AttributeFragment>,
    pub relevant_cis: BTreeSet<CiId>,
    pub relevant_names: BTreeSet<String>,
}

/// A bulk relation replacement.
///
/// Within one layer, the relations anchored (per `direction`) on a CI with
/// a predicate from `relevant` end up exactly as given by `fragments`.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRelationScope {
    pub layer: LayerId,
    pub direction: RelationDirection,
    pub fragments: Vec<Relation>,
    pub relevant: BTreeSet<(CiId, String)>,
}

/// A selection of relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSelection {
    All,
    /// Relations whose source is one of the CIs.
    From(BTreeSet<CiId>),
    /// Relations whose target is one of the CIs.
    To(BTreeSet<CiId>),
    /// Relations with either endpoint among the CIs.
    Touching(BTreeSet<CiId>),
}

impl RelationSelection {
    pub fn for_ci_selection(selection: &CiSelection) -> Self {
        match selection {
            CiSelection::All => Self::All,
            CiSelection::Specific(cis) => Self::Touching(cis.clone()),
        }
    }

    pub fn matches(&self, relation: &Relation) -> bool {
        match self {
            Self::All => true,
            Self::From(cis) => cis.contains(&relation.from),
            Self::To(cis) => cis.contains(&relation.to),
            Self::Touching(cis) => cis.contains(&relation.from) || cis.contains(&relation.to),
        }
    }
}

// =============================================================================
// STORE TRAITS
// =============================================================================

/// CI allocation and listing.
pub trait CiStore {
    fn create_ci(&mut self) -> Result<CiId, CmdbError>;

    /// Existing CIs in the selection, in ascending order.
    fn get_ciids(&self, selection: &CiSelection) -> Result<Vec<CiId>, CmdbError>;
}

/// Layered attribute storage.
pub trait AttributeStore {
    /// Write `value`; returns whether anything changed.
    fn insert_attribute(
        &mut self,
        name: &str,
        value: AttributeValue,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError>;

    /// Remove the attribute from `layer`; returns whether anything changed.
    fn remove_attribute(
        &mut self,
        name: &str,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError>;

    fn get_merged_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<AttributeSnapshot, CmdbError>;

    /// Apply a [`BulkAttributeScope`]; returns the number of changed
    /// attributes.
    fn bulk_replace_attributes(
        &mut self,
        scope: &BulkAttributeScope,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<usize, CmdbError> {
        for fragment in &scope.fragments {
            if !scope.relevant_cis.contains(&fragment.ciid)
                || !scope.relevant_names.contains(&fragment.name)
            {
                return Err(CmdbError::Storage(format!(
                    "fragment {} of CI {} lies outside the bulk scope",
                    fragment.name, fragment.ciid
                )));
            }
        }
        if scope.relevant_cis.is_empty() || scope.relevant_names.is_empty() {
            return Ok(0);
        }

        let cis = CiSelection::Specific(scope.relevant_cis.clone());
        let names = AttributeSelection::Named(scope.relevant_names.clone());
        let mut present: BTreeSet<(CiId, String)> = BTreeSet::new();
        for probe in removal_probe_layers(&scope.layer, mask_handling) {
            let existing = self.get_merged_attributes(&cis, &names, &probe, TimeThreshold::Latest)?;
            for (ciid, attributes) in existing {
                present.extend(attributes.into_keys().map(|name| (ciid, name)));
            }
        }

        let mut changed = 0usize;
        let mut written = BTreeSet::new();
        for fragment in &scope.fragments {
            if self.insert_attribute(
                &fragment.name,
                fragment.value.clone(),
                fragment.ciid,
                &scope.layer,
                changeset,
                other_layers,
            )? {
                changed += 1;
            }
            written.insert((fragment.ciid, fragment.name.clone()));
        }
        for (ciid, name) in present.difference(&written) {
            if self.remove_attribute(name, *ciid, &scope.layer, changeset, mask_handling)? {
                changed += 1;
            }
        }
        tracing::debug!(layer = %scope.layer, changed, "bulk attribute replace");
        Ok(changed)
    }
}

/// Layered relation storage.
pub trait RelationStore {
    fn insert_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError>;

    fn remove_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError>;

    /// Merged relations in the selection, in ascending relation order.
    fn get_merged_relations(
        &self,
        selection: &RelationSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Vec<MergedRelation>, CmdbError>;

    /// Apply a [`BulkRelationScope`]; returns the number of changed
    /// relations.
    fn bulk_replace_relations(
        &mut self,
        scope: &BulkRelationScope,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<usize, CmdbError> {
        let in_scope = |relation: &Relation| {
            scope
                .relevant
                .contains(&(relation.anchor(scope.direction), relation.predicate.clone()))
        };
        if let Some(outside) = scope.fragments.iter().find(|r| !in_scope(r)) {
            return Err(CmdbError::Storage(format!(
                "relation {} -[{}]-> {} lies outside the bulk scope",
                outside.from, outside.predicate, outside.to
            )));
        }
        if scope.relevant.is_empty() {
            return Ok(0);
        }

        let anchors: BTreeSet<CiId> = scope.relevant.iter().map(|(ciid, _)| *ciid).collect();
        let selection = match scope.direction {
            RelationDirection::Forward => RelationSelection::From(anchors),
            RelationDirection::Back => RelationSelection::To(anchors),
        };
        let mut present = BTreeSet::new();
        for probe in removal_probe_layers(&scope.layer, mask_handling) {
            let existing = self.get_merged_relations(&selection, &probe, TimeThreshold::Latest)?;
            present.extend(
                existing
                    .into_iter()
                    .map(|m| m.relation)
                    .filter(|r| in_scope(r)),
            );
        }

        let mut changed = 0usize;
        let written: BTreeSet<Relation> = scope.fragments.iter().cloned().collect();
        for relation in &written {
            if self.insert_relation(relation, &scope.layer, changeset, other_layers)? {
                changed += 1;
            }
        }
        for relation in present.difference(&written) {
            if self.remove_relation(relation, &scope.layer, changeset, mask_handling)? {
                changed += 1;
            }
        }
        tracing::debug!(layer = %scope.layer, changed, "bulk relation replace");
        Ok(changed)
    }
}

/// Everything the trait model needs from storage.
pub trait CmdbStore: CiStore + AttributeStore + RelationStore {}

impl<T: CiStore + AttributeStore + RelationStore> CmdbStore for T {}

/// Layer sets whose contents are candidates for removal in a bulk replace:
/// the write layer itself, plus the lower read layers when masking applies.
fn removal_probe_layers(layer: &LayerId, mask_handling: &MaskHandlingForRemoval) -> Vec<LayerSet> {
    let own = LayerSet::single(layer.clone());
    match mask_handling {
        MaskHandlingForRemoval::ApplyNoMask => vec![own],
        MaskHandlingForRemoval::ApplyMaskIfNecessary(read_layers) => {
            let below = read_layers.below(layer);
            if below.is_empty() {
                vec![own]
            } else {
                vec![own, below]
            }
        }
    }
}
