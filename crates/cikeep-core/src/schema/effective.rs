//! # Effective Traits
//!
//! Conformance of a CI to a trait, evaluated from the merged view.
//!
//! A CI conforms when every required attribute passes its template check
//! and every required relation passes its cardinality check. Optional
//! attributes and relations are carried along only when they pass.

use super::{TemplateViolation, TraitSchema};
use crate::store::{MergedAttribute, MergedRelation};
use crate::types::{CiId, RelationDirection};
use crate::value::AttributeValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A trait as it is currently satisfied by one CI.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveTrait {
    pub ciid: CiId,
    pub trait_id: String,
    /// Merged attributes keyed by trait attribute identifier.
    pub attributes: BTreeMap<String, MergedAttribute>,
    /// Related CIIDs (sorted) keyed by trait relation identifier.
    pub relations: BTreeMap<String, Vec<CiId>>,
}

impl EffectiveTrait {
    pub fn attribute_value(&self, identifier: &str) -> Option<&AttributeValue> {
        self.attributes.get(identifier).map(|a| &a.value)
    }

    pub fn related(&self, identifier: &str) -> &[CiId] {
        self.relations
            .get(identifier)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// A failed requirement of a trait, by trait identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitViolation {
    pub identifier: String,
    pub violation: TemplateViolation,
}

impl fmt::Display for TraitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.identifier, self.violation)
    }
}

/// Group relations by each CI they touch.
pub fn relations_by_ci(relations: &[MergedRelation]) -> BTreeMap<CiId, Vec<&MergedRelation>> {
    let mut index: BTreeMap<CiId, Vec<&MergedRelation>> = BTreeMap::new();
    for relation in relations {
        index.entry(relation.relation.from).or_default().push(relation);
        if relation.relation.to != relation.relation.from {
            index.entry(relation.relation.to).or_default().push(relation);
        }
    }
    index
}

fn related_ciids(
    ciid: CiId,
    predicate_id: &str,
    direction: RelationDirection,
    relations: &[&MergedRelation],
) -> Vec<CiId> {
    let related: BTreeSet<CiId> = relations
        .iter()
        .map(|r| &r.relation)
        .filter(|r| r.predicate == predicate_id)
        .filter_map(|r| match direction {
            RelationDirection::Forward if r.from == ciid => Some(r.to),
            RelationDirection::Back if r.to == ciid => Some(r.from),
            _ => None,
        })
        .collect();
    related.into_iter().collect()
}

impl TraitSchema {
    /// Evaluate conformance of `ciid`.
    ///
    /// `attributes` are the CI's merged attributes keyed by CI attribute
    /// name; `relations` are merged relations touching the CI.
    pub fn check_conformance(
        &self,
        ciid: CiId,
        attributes: Option<&BTreeMap<String, MergedAttribute>>,
        relations: &[&MergedRelation],
    ) -> Result<EffectiveTrait, Vec<TraitViolation>> {
        let mut violations = Vec::new();
        let mut effective = EffectiveTrait {
            ciid,
            trait_id: self.id().to_string(),
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        };

        for (attribute, required) in self.attributes() {
            let merged = attributes.and_then(|a| a.get(&attribute.template.name));
            let problems = attribute.template.check(merged.map(|m| &m.value));
            match (problems.is_empty(), merged) {
                (true, Some(merged)) => {
                    effective
                        .attributes
                        .insert(attribute.identifier.clone(), merged.clone());
                }
                _ if required => {
                    violations.extend(problems.into_iter().map(|violation| TraitViolation {
                        identifier: attribute.identifier.clone(),
                        violation,
                    }));
                }
                _ => {}
            }
        }

        for (relation, required) in self.relations() {
            let template = &relation.template;
            let related = related_ciids(ciid, &template.predicate_id, template.direction, relations);
            match template.check(related.len()) {
                None => {
                    effective
                        .relations
                        .insert(relation.identifier.clone(), related);
                }
                Some(violation) if required => violations.push(TraitViolation {
                    identifier: relation.identifier.clone(),
                    violation,
                }),
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(effective)
        } else {
            Err(violations)
        }
    }

    /// The effective trait of `ciid`, if it conforms.
    pub fn resolve_effective(
        &self,
        ciid: CiId,
        attributes: Option<&BTreeMap<String, MergedAttribute>>,
        relations: &[&MergedRelation],
    ) -> Option<EffectiveTrait> {
        self.check_conformance(ciid, attributes, relations).ok()
    }

    /// Effective traits of every conformant CI among `candidates`.
    pub fn resolve_effective_many(
        &self,
        candidates: impl IntoIterator<Item = CiId>,
        attributes: &BTreeMap<CiId, BTreeMap<String, MergedAttribute>>,
        relations: &[MergedRelation],
    ) -> BTreeMap<CiId, EffectiveTrait> {
        let index = relations_by_ci(relations);
        candidates
            .into_iter()
            .filter_map(|ciid| {
                let touching = index.get(&ciid).map(Vec::as_slice).unwrap_or_default();
                self.resolve_effective(ciid, attributes.get(&ciid), touching)
                    .map(|et| (ciid, et))
            })
            .collect()
    }
}
