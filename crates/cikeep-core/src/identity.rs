//! # Identity Resolution
//!
//! Correlates entity records with CIs through the trait's ID attributes.
//!
//! An [`Identity`] is the ordered tuple of ID attribute values of one
//! entity. A CI matches an identity when every ID attribute is present in
//! the snapshot and equal to the corresponding component.
//!
//! ## Determinism
//!
//! Several CIs may carry the same identity. Resolution always picks the
//! lowest [`CiId`], independent of the order the snapshot is iterated in.

use crate::entity::{EntityReflector, TraitEntity};
use crate::schema::TraitSchema;
use crate::store::{AttributeSnapshot, MergedAttribute};
use crate::types::{CiId, CmdbError};
use crate::value::AttributeValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// The ID attribute values of one entity, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Single(AttributeValue),
    Composite(Vec<AttributeValue>),
}

impl Identity {
    /// One component yields [`Identity::Single`], more a composite.
    /// Returns `None` for an empty list.
    pub fn from_values(mut values: Vec<AttributeValue>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(Self::Single),
            _ => Some(Self::Composite(values)),
        }
    }

    pub fn values(&self) -> &[AttributeValue] {
        match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Composite(values) => values,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(value) => write!(f, "{value}"),
            Self::Composite(values) => {
                write!(f, "(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<AttributeValue> for Identity {
    fn from(value: AttributeValue) -> Self {
        Self::Single(value)
    }
}

/// Matches identities against attribute snapshots of one trait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityResolver {
    trait_id: String,
    id_attributes: Vec<String>,
}

impl IdentityResolver {
    /// Resolver over the ID attributes of `schema`.
    ///
    /// Fails for traits without ID attributes.
    pub fn new(schema: &TraitSchema) -> Result<Self, CmdbError> {
        let id_attributes: Vec<String> = schema
            .id_attribute_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        if id_attributes.is_empty() {
            return Err(CmdbError::InvalidTrait {
                trait_id: schema.id().to_string(),
                reason: "trait declares no ID attribute".into(),
            });
        }
        Ok(Self {
            trait_id: schema.id().to_string(),
            id_attributes,
        })
    }

    pub fn trait_id(&self) -> &str {
        &self.trait_id
    }

    /// CI attribute names of the ID attributes, in declaration order.
    pub fn id_attributes(&self) -> &[String] {
        &self.id_attributes
    }

    /// Project the ID fields of `entity`.
    pub fn extract_identity<E: TraitEntity>(
        &self,
        reflector: &EntityReflector<E>,
        entity: &E,
    ) -> Result<Identity, CmdbError> {
        let values = reflector.identity_values(entity)?;
        if values.len() != self.id_attributes.len() {
            return Err(CmdbError::InvalidTrait {
                trait_id: self.trait_id.clone(),
                reason: format!(
                    "entity yields {} ID values for {} ID attributes",
                    values.len(),
                    self.id_attributes.len()
                ),
            });
        }
        Identity::from_values(values).ok_or_else(|| CmdbError::InvalidTrait {
            trait_id: self.trait_id.clone(),
            reason: "trait declares no ID attribute".into(),
        })
    }

    /// The identity carried by one CI's merged attributes, if it has every
    /// ID attribute.
    pub fn identity_of(&self, attributes: &BTreeMap<String, MergedAttribute>) -> Option<Identity> {
        let values = self
            .id_attributes
            .iter()
            .map(|name| attributes.get(name).map(|a| a.value.clone()))
            .collect::<Option<Vec<_>>>()?;
        Identity::from_values(values)
    }

    /// Whether the CI's attributes carry `identity`.
    pub fn matches(
        &self,
        identity: &Identity,
        attributes: &BTreeMap<String, MergedAttribute>,
    ) -> bool {
        identity.len() == self.id_attributes.len()
            && self
                .id_attributes
                .iter()
                .zip(identity.values())
                .all(|(name, value)| attributes.get(name).is_some_and(|a| &a.value == value))
    }

    /// Every CI in `snapshot` carrying `identity`, ascending.
    pub fn resolve_all(&self, identity: &Identity, snapshot: &AttributeSnapshot) -> Vec<CiId> {
        let mut found: Vec<CiId> = snapshot
            .iter()
            .filter(|(_, attributes)| self.matches(identity, attributes))
            .map(|(ciid, _)| *ciid)
            .collect();
        found.sort();
        found
    }

    /// The lowest CI in `snapshot` carrying `identity`.
    pub fn resolve(&self, identity: &Identity, snapshot: &AttributeSnapshot) -> Option<CiId> {
        snapshot
            .iter()
            .filter(|(_, attributes)| self.matches(identity, attributes))
            .map(|(ciid, _)| *ciid)
            .min()
    }

    /// Resolve many identities at once.
    ///
    /// The snapshot is inverted into an (attribute, value) → CIs index
    /// once; each identity then intersects the candidate sets of its
    /// components, stopping as soon as the intersection is empty.
    /// Identities without a match are absent from the result.
    pub fn bulk_resolve<'a>(
        &self,
        identities: impl IntoIterator<Item = &'a Identity>,
        snapshot: &AttributeSnapshot,
    ) -> HashMap<Identity, CiId> {
        let mut index: HashMap<(&str, &AttributeValue), BTreeSet<CiId>> = HashMap::new();
        for (ciid, attributes) in snapshot {
            for name in &self.id_attributes {
                if let Some(attribute) = attributes.get(name) {
                    index
                        .entry((name.as_str(), &attribute.value))
                        .or_default()
                        .insert(*ciid);
                }
            }
        }

        let mut resolved = HashMap::new();
        for identity in identities {
            if identity.len() != self.id_attributes.len() {
                continue;
            }
            let mut candidates: Option<BTreeSet<CiId>> = None;
            for (name, value) in self.id_attributes.iter().zip(identity.values()) {
                let Some(matching) = index.get(&(name.as_str(), value)) else {
                    candidates = Some(BTreeSet::new());
                    break;
                };
                let narrowed = match candidates {
                    None => matching.clone(),
                    Some(current) => current.intersection(matching).copied().collect(),
                };
                let exhausted = narrowed.is_empty();
                candidates = Some(narrowed);
                if exhausted {
                    break;
                }
            }
            if let Some(ciid) = candidates.and_then(|c| c.first().copied()) {
                resolved.insert(identity.clone(), ciid);
            }
        }
        resolved
    }
}
