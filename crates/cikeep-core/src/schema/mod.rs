//! # Trait Schemas
//!
//! Declarative, immutable descriptions of traits.
//!
//! A trait lists required and optional attribute templates and relation
//! templates. A CI satisfies ("has") a trait when its merged attributes and
//! relations pass every required template; see [`effective`].
//!
//! Schemas are built either with [`TraitSchemaBuilder`], derived from an
//! entity description (see [`crate::entity`]), or deserialised from
//! configuration and collected in a [`registry::TraitSet`].

pub mod constraint;
pub mod effective;
pub mod registry;

pub use constraint::{TemplateViolation, TextRegex, ValueConstraint};
pub use effective::{EffectiveTrait, TraitViolation};
pub use registry::{TraitRegistry, TraitSet};

use crate::types::{CmdbError, RelationDirection};
use crate::value::{AttributeValue, AttributeValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// =============================================================================
// TEMPLATES
// =============================================================================

/// Requirements on one CI attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiAttributeTemplate {
    /// Name of the underlying CI attribute.
    pub name: String,
    /// Required value type; `None` accepts any type.
    #[serde(rename = "type", default)]
    pub value_type: Option<AttributeValueType>,
    /// Required array-ness; `None` accepts both.
    #[serde(default)]
    pub is_array: Option<bool>,
    /// Whether the attribute identifies entities of the trait.
    #[serde(default)]
    pub is_id: bool,
    #[serde(default)]
    pub constraints: Vec<ValueConstraint>,
}

impl CiAttributeTemplate {
    pub fn new(name: impl Into<String>, value_type: AttributeValueType, is_array: bool) -> Self {
        Self {
            name: name.into(),
            value_type: Some(value_type),
            is_array: Some(is_array),
            is_id: false,
            constraints: Vec::new(),
        }
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }

    pub fn with_constraint(mut self, constraint: ValueConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Check a merged value (or its absence) against the template.
    pub fn check(&self, value: Option<&AttributeValue>) -> Vec<TemplateViolation> {
        let Some(value) = value else {
            return vec![TemplateViolation::Missing];
        };
        let mut violations = Vec::new();
        if let Some(expected) = self.value_type {
            if expected != value.value_type() {
                violations.push(TemplateViolation::WrongType {
                    expected,
                    found: value.value_type(),
                });
            }
        }
        if let Some(expected) = self.is_array {
            if expected != value.is_array() {
                violations.push(TemplateViolation::WrongArrayness {
                    expected,
                    found: value.is_array(),
                });
            }
        }
        // Constraint checks assume the declared shape.
        if violations.is_empty() {
            for constraint in &self.constraints {
                violations.extend(constraint.check(value));
            }
        }
        violations
    }
}

/// Requirements on the relations of one predicate in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTemplate {
    pub predicate_id: String,
    pub direction: RelationDirection,
    #[serde(default)]
    pub min_cardinality: Option<usize>,
    #[serde(default)]
    pub max_cardinality: Option<usize>,
}

impl RelationTemplate {
    pub fn new(predicate_id: impl Into<String>, direction: RelationDirection) -> Self {
        Self {
            predicate_id: predicate_id.into(),
            direction,
            min_cardinality: None,
            max_cardinality: None,
        }
    }

    pub fn with_cardinality(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_cardinality = min;
        self.max_cardinality = max;
        self
    }

    pub fn check(&self, count: usize) -> Option<TemplateViolation> {
        let below = self.min_cardinality.is_some_and(|min| count < min);
        let above = self.max_cardinality.is_some_and(|max| count > max);
        (below || above).then_some(TemplateViolation::Cardinality {
            min: self.min_cardinality,
            max: self.max_cardinality,
            actual: count,
        })
    }
}

/// An attribute template under a trait-local identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitAttribute {
    pub identifier: String,
    #[serde(flatten)]
    pub template: CiAttributeTemplate,
}

impl TraitAttribute {
    pub fn new(identifier: impl Into<String>, template: CiAttributeTemplate) -> Self {
        Self {
            identifier: identifier.into(),
            template,
        }
    }
}

/// A relation template under a trait-local identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitRelation {
    pub identifier: String,
    #[serde(flatten)]
    pub template: RelationTemplate,
}

impl TraitRelation {
    pub fn new(identifier: impl Into<String>, template: RelationTemplate) -> Self {
        Self {
            identifier: identifier.into(),
            template,
        }
    }
}

// =============================================================================
// TRAIT SCHEMA
// =============================================================================

/// Declarative description of a trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitSchema {
    id: String,
    #[serde(default)]
    required_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    optional_attributes: Vec<TraitAttribute>,
    #[serde(default)]
    required_relations: Vec<TraitRelation>,
    #[serde(default)]
    optional_relations: Vec<TraitRelation>,
}

impl TraitSchema {
    pub fn builder(id: impl Into<String>) -> TraitSchemaBuilder {
        TraitSchemaBuilder {
            schema: Self {
                id: id.into(),
                required_attributes: Vec::new(),
                optional_attributes: Vec::new(),
                required_relations: Vec::new(),
                optional_relations: Vec::new(),
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn required_attributes(&self) -> &[TraitAttribute] {
        &self.required_attributes
    }

    pub fn optional_attributes(&self) -> &[TraitAttribute] {
        &self.optional_attributes
    }

    pub fn required_relations(&self) -> &[TraitRelation] {
        &self.required_relations
    }

    pub fn optional_relations(&self) -> &[TraitRelation] {
        &self.optional_relations
    }

    /// All attributes, required first, paired with whether they are
    /// required.
    pub fn attributes(&self) -> impl Iterator<Item = (&TraitAttribute, bool)> {
        self.required_attributes
            .iter()
            .map(|a| (a, true))
            .chain(self.optional_attributes.iter().map(|a| (a, false)))
    }

    /// All relations, required first, paired with whether they are required.
    pub fn relations(&self) -> impl Iterator<Item = (&TraitRelation, bool)> {
        self.required_relations
            .iter()
            .map(|r| (r, true))
            .chain(self.optional_relations.iter().map(|r| (r, false)))
    }

    /// Names of every CI attribute the trait declares.
    pub fn attribute_names(&self) -> BTreeSet<String> {
        self.attributes()
            .map(|(a, _)| a.template.name.clone())
            .collect()
    }

    /// CI attribute names of the ID attributes, in declaration order.
    pub fn id_attribute_names(&self) -> Vec<&str> {
        self.attributes()
            .filter(|(a, _)| a.template.is_id)
            .map(|(a, _)| a.template.name.as_str())
            .collect()
    }

    pub fn find_relation(&self, identifier: &str) -> Option<&TraitRelation> {
        self.relations()
            .map(|(r, _)| r)
            .find(|r| r.identifier == identifier)
    }

    /// Check the structural invariants of the schema.
    pub fn validate(&self) -> Result<(), CmdbError> {
        let invalid = |reason: String| CmdbError::InvalidTrait {
            trait_id: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("trait id must not be empty".to_string()));
        }

        let mut identifiers = BTreeSet::new();
        let mut names = BTreeSet::new();
        for (attribute, required) in self.attributes() {
            if !identifiers.insert(attribute.identifier.as_str()) {
                return Err(invalid(format!(
                    "duplicate identifier {}",
                    attribute.identifier
                )));
            }
            if !names.insert(attribute.template.name.as_str()) {
                return Err(invalid(format!(
                    "attribute {} is declared twice",
                    attribute.template.name
                )));
            }
            if attribute.template.is_id && !required {
                return Err(invalid(format!(
                    "ID attribute {} must be required",
                    attribute.identifier
                )));
            }
            for constraint in &attribute.template.constraints {
                constraint.validate().map_err(|reason| {
                    invalid(format!("attribute {}: {}", attribute.identifier, reason))
                })?;
            }
        }
        let mut edges = BTreeSet::new();
        for (relation, _) in self.relations() {
            if !identifiers.insert(relation.identifier.as_str()) {
                return Err(invalid(format!(
                    "duplicate identifier {}",
                    relation.identifier
                )));
            }
            let template = &relation.template;
            // Two fields over the same edges would read and overwrite each other.
            if !edges.insert((template.predicate_id.as_str(), template.direction)) {
                return Err(invalid(format!(
                    "relation {}: predicate {} ({:?}) is already used by another field",
                    relation.identifier, template.predicate_id, template.direction
                )));
            }
            if let (Some(min), Some(max)) = (template.min_cardinality, template.max_cardinality) {
                if min > max {
                    return Err(invalid(format!(
                        "relation {}: minimum cardinality {} exceeds maximum {}",
                        relation.identifier, min, max
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`TraitSchema`]; `build` validates.
#[derive(Debug, Clone)]
pub struct TraitSchemaBuilder {
    schema: TraitSchema,
}

impl TraitSchemaBuilder {
    pub fn required_attribute(
        mut self,
        identifier: impl Into<String>,
        template: CiAttributeTemplate,
    ) -> Self {
        self.schema
            .required_attributes
            .push(TraitAttribute::new(identifier, template));
        self
    }

    pub fn optional_attribute(
        mut self,
        identifier: impl Into<String>,
        template: CiAttributeTemplate,
    ) -> Self {
        self.schema
            .optional_attributes
            .push(TraitAttribute::new(identifier, template));
        self
    }

    pub fn required_relation(
        mut self,
        identifier: impl Into<String>,
        template: RelationTemplate,
    ) -> Self {
        self.schema
            .required_relations
            .push(TraitRelation::new(identifier, template));
        self
    }

    pub fn optional_relation(
        mut self,
        identifier: impl Into<String>,
        template: RelationTemplate,
    ) -> Self {
        self.schema
            .optional_relations
            .push(TraitRelation::new(identifier, template));
        self
    }

    pub fn build(self) -> Result<TraitSchema, CmdbError> {
        self.schema.validate()?;
        Ok(self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_schema() -> TraitSchema {
        TraitSchema::builder("host")
            .required_attribute(
                "hostname",
                CiAttributeTemplate::new("hostname", AttributeValueType::Text, false).id(),
            )
            .optional_attribute(
                "os",
                CiAttributeTemplate::new("os", AttributeValueType::Text, false),
            )
            .optional_relation(
                "runs_on",
                RelationTemplate::new("runs_on", RelationDirection::Forward),
            )
            .build()
            .expect("valid schema")
    }

    #[test]
    fn template_check_type_and_arrayness() {
        let template = CiAttributeTemplate::new("a", AttributeValueType::Integer, false);
        assert!(template.check(Some(&AttributeValue::Integer(1))).is_empty());
        assert_eq!(
            template.check(None),
            vec![TemplateViolation::Missing]
        );
        assert!(matches!(
            template.check(Some(&AttributeValue::text("1"))).as_slice(),
            [TemplateViolation::WrongType { .. }]
        ));
        assert!(matches!(
            template
                .check(Some(&AttributeValue::IntegerArray(vec![1])))
                .as_slice(),
            [TemplateViolation::WrongArrayness { .. }]
        ));
    }

    #[test]
    fn untyped_template_accepts_anything() {
        let template = CiAttributeTemplate {
            name: "any".into(),
            value_type: None,
            is_array: None,
            is_id: false,
            constraints: Vec::new(),
        };
        assert!(template.check(Some(&AttributeValue::Boolean(true))).is_empty());
        assert!(template.check(Some(&AttributeValue::TextArray(vec![]))).is_empty());
    }

    #[test]
    fn relation_cardinality() {
        let template = RelationTemplate::new("p", RelationDirection::Back)
            .with_cardinality(Some(1), Some(2));
        assert!(template.check(0).is_some());
        assert!(template.check(1).is_none());
        assert!(template.check(3).is_some());
    }

    #[test]
    fn schema_accessors() {
        let schema = host_schema();
        assert_eq!(schema.id(), "host");
        assert_eq!(schema.id_attribute_names(), vec!["hostname"]);
        assert_eq!(
            schema.attribute_names().into_iter().collect::<Vec<_>>(),
            vec!["hostname".to_string(), "os".to_string()]
        );
        assert!(schema.find_relation("runs_on").is_some());
        assert!(schema.find_relation("nope").is_none());
    }

    #[test]
    fn duplicate_identifiers_rejected() {
        let result = TraitSchema::builder("t")
            .required_attribute("a", CiAttributeTemplate::new("x", AttributeValueType::Text, false))
            .optional_relation("a", RelationTemplate::new("p", RelationDirection::Forward))
            .build();
        assert!(matches!(result, Err(CmdbError::InvalidTrait { .. })));
    }

    #[test]
    fn shared_predicate_and_direction_rejected() {
        let result = TraitSchema::builder("t")
            .optional_relation("x", RelationTemplate::new("p", RelationDirection::Forward))
            .optional_relation("y", RelationTemplate::new("p", RelationDirection::Forward))
            .build();
        assert!(matches!(result, Err(CmdbError::InvalidTrait { .. })));

        let both_directions = TraitSchema::builder("t")
            .optional_relation("out", RelationTemplate::new("p", RelationDirection::Forward))
            .optional_relation("in", RelationTemplate::new("p", RelationDirection::Back))
            .build();
        assert!(both_directions.is_ok());
    }

    #[test]
    fn optional_id_rejected() {
        let result = TraitSchema::builder("t")
            .optional_attribute(
                "a",
                CiAttributeTemplate::new("x", AttributeValueType::Text, false).id(),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn invalid_constraint_rejected() {
        let result = TraitSchema::builder("t")
            .required_attribute(
                "a",
                CiAttributeTemplate::new("x", AttributeValueType::Text, false).with_constraint(
                    ValueConstraint::TextLength {
                        min: Some(5),
                        max: Some(2),
                    },
                ),
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn schema_serde_shape() {
        let json = serde_json::json!({
            "id": "host",
            "required_attributes": [
                {"identifier": "hostname", "name": "hostname", "type": "Text", "is_array": false, "is_id": true}
            ],
            "optional_relations": [
                {"identifier": "runs_on", "predicate_id": "runs_on", "direction": "forward"}
            ]
        });
        let schema: TraitSchema = serde_json::from_value(json).expect("deserialize");
        schema.validate().expect("valid");
        assert_eq!(schema.id_attribute_names(), vec!["hostname"]);
        assert_eq!(schema.optional_relations().len(), 1);
    }
}
