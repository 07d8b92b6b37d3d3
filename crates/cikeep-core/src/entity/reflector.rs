//! # Entity Reflector
//!
//! Derives a [`TraitSchema`] from an [`EntityDescription`] and converts
//! entities to and from CI data.
//!
//! Derivation fails fast, before any storage access, when a field carries
//! no annotation, both annotations, or an annotation that does not match
//! its accessor, and when a non-singleton entity declares no ID attribute.

use super::field::{FieldShape, RelationShape, effective_type};
use super::{Accessor, EntityDescription, FieldDescriptor, TraitEntity};
use crate::primitives::MAX_COMPOSITE_ID_FIELDS;
use crate::schema::{CiAttributeTemplate, EffectiveTrait, RelationTemplate, TraitSchema};
use crate::store::{AttributeFragment, Relation};
use crate::types::{CiId, CmdbError, RelationDirection};
use crate::value::{AttributeValue, AttributeValueType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How one field maps onto the trait.
#[derive(Debug, Clone)]
enum Role {
    Attribute {
        name: String,
        required: bool,
        multiline: bool,
    },
    Relation {
        predicate_id: String,
        direction: RelationDirection,
        required: bool,
    },
}

/// Related CIs of one relation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFragment {
    pub identifier: String,
    pub predicate_id: String,
    pub direction: RelationDirection,
    pub targets: Vec<CiId>,
}

impl RelationFragment {
    /// The relations this fragment stands for, anchored on `ciid`.
    pub fn relations(&self, ciid: CiId) -> Vec<Relation> {
        self.targets
            .iter()
            .map(|target| match self.direction {
                RelationDirection::Forward => Relation::new(ciid, *target, &self.predicate_id),
                RelationDirection::Back => Relation::new(*target, ciid, &self.predicate_id),
            })
            .collect()
    }
}

/// The CI data of one entity. Absent optional fields are left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFragments {
    pub attributes: Vec<AttributeFragment>,
    pub relations: Vec<RelationFragment>,
}

/// Schema and conversions of one entity type.
#[derive(Debug)]
pub struct EntityReflector<E> {
    schema: Arc<TraitSchema>,
    description: EntityDescription<E>,
    roles: Vec<Role>,
}

impl<E: TraitEntity> EntityReflector<E> {
    /// Describe `E` and derive its schema.
    pub fn new() -> Result<Self, CmdbError> {
        let description = E::describe();
        let roles = description
            .fields
            .iter()
            .map(|field| field_role::<E>(field))
            .collect::<Result<Vec<_>, _>>()?;
        let schema = build_schema(&description, &roles)?;
        tracing::debug!(trait_id = %schema.id(), fields = roles.len(), "trait schema derived");
        Ok(Self {
            schema: Arc::new(schema),
            description,
            roles,
        })
    }

    /// The schema `E` maps onto.
    pub fn derive_schema() -> Result<TraitSchema, CmdbError> {
        Self::new().map(|reflector| reflector.schema.as_ref().clone())
    }

    pub fn schema(&self) -> &Arc<TraitSchema> {
        &self.schema
    }

    pub fn trait_id(&self) -> &str {
        self.schema.id()
    }

    pub fn is_singleton(&self) -> bool {
        self.description.singleton
    }

    fn fields(&self) -> impl Iterator<Item = (&FieldDescriptor<E>, &Role)> {
        self.description.fields.iter().zip(&self.roles)
    }

    fn missing(&self, field: &str) -> CmdbError {
        CmdbError::MissingField {
            trait_id: self.trait_id().to_string(),
            field: field.to_string(),
        }
    }

    fn conversion(&self, field: &str, reason: String) -> CmdbError {
        CmdbError::FieldConversion {
            trait_id: self.trait_id().to_string(),
            field: field.to_string(),
            reason,
        }
    }

    /// Values of the ID attributes of `entity`, in declaration order.
    pub fn identity_values(&self, entity: &E) -> Result<Vec<AttributeValue>, CmdbError> {
        let mut values = Vec::new();
        for (field, role) in self.fields() {
            let (Role::Attribute { multiline, .. }, Accessor::Value { encode, .. }) =
                (role, &field.accessor)
            else {
                continue;
            };
            if !field.attribute.as_ref().is_some_and(|a| a.id) {
                continue;
            }
            let value = encode(entity, *multiline)
                .map_err(|reason| self.conversion(field.name, reason))?
                .ok_or_else(|| self.missing(field.name))?;
            values.push(value);
        }
        Ok(values)
    }

    /// The CI data `entity` stands for on CI `ciid`.
    pub fn entity_to_fragments(
        &self,
        entity: &E,
        ciid: CiId,
    ) -> Result<EntityFragments, CmdbError> {
        let mut fragments = EntityFragments::default();
        for (field, role) in self.fields() {
            match (role, &field.accessor) {
                (
                    Role::Attribute {
                        name,
                        required,
                        multiline,
                    },
                    Accessor::Value { encode, .. },
                ) => {
                    let value = encode(entity, *multiline)
                        .map_err(|reason| self.conversion(field.name, reason))?;
                    match value {
                        Some(value) => fragments
                            .attributes
                            .push(AttributeFragment::new(ciid, name.clone(), value)),
                        None if *required => return Err(self.missing(field.name)),
                        None => {}
                    }
                }
                (
                    Role::Relation {
                        predicate_id,
                        direction,
                        required,
                    },
                    Accessor::Related { targets, .. },
                ) => match targets(entity) {
                    Some(mut targets) => {
                        targets.sort();
                        targets.dedup();
                        fragments.relations.push(RelationFragment {
                            identifier: field.name.to_string(),
                            predicate_id: predicate_id.clone(),
                            direction: *direction,
                            targets,
                        });
                    }
                    None if *required => return Err(self.missing(field.name)),
                    None => {}
                },
                _ => return Err(self.conversion(field.name, "inconsistent field role".into())),
            }
        }
        Ok(fragments)
    }

    /// Build an entity from CI data.
    ///
    /// `attributes` are keyed by CI attribute name, `relations` (related
    /// CIIDs) by field identifier. Missing optional fields keep their
    /// `Default` value.
    pub fn snapshot_to_entity(
        &self,
        attributes: &BTreeMap<String, AttributeValue>,
        relations: &BTreeMap<String, Vec<CiId>>,
    ) -> Result<E, CmdbError> {
        self.assemble(
            |_, name| attributes.get(name).cloned(),
            |identifier| relations.get(identifier).map(Vec::as_slice),
        )
    }

    /// Build an entity from the effective trait of a conformant CI.
    pub fn effective_to_entity(&self, effective: &EffectiveTrait) -> Result<E, CmdbError> {
        self.assemble(
            |identifier, _| effective.attribute_value(identifier).cloned(),
            |identifier| {
                effective
                    .relations
                    .get(identifier)
                    .map(Vec::as_slice)
            },
        )
    }

    fn assemble<'a>(
        &self,
        attribute: impl Fn(&str, &str) -> Option<AttributeValue>,
        related: impl Fn(&str) -> Option<&'a [CiId]>,
    ) -> Result<E, CmdbError> {
        let mut entity = E::default();
        for (field, role) in self.fields() {
            match (role, &field.accessor) {
                (Role::Attribute { name, required, .. }, Accessor::Value { decode, .. }) => {
                    match attribute(field.name, name) {
                        Some(value) => decode(&mut entity, value)
                            .map_err(|reason| self.conversion(field.name, reason))?,
                        None if *required => return Err(self.missing(field.name)),
                        None => {}
                    }
                }
                (Role::Relation { required, .. }, Accessor::Related { assign, .. }) => {
                    match related(field.name) {
                        Some(targets) => assign(&mut entity, targets)
                            .map_err(|reason| self.conversion(field.name, reason))?,
                        None if *required => return Err(self.missing(field.name)),
                        None => {}
                    }
                }
                _ => return Err(self.conversion(field.name, "inconsistent field role".into())),
            }
        }
        Ok(entity)
    }
}

// =============================================================================
// DERIVATION
// =============================================================================

fn derivation_error<E>(reason: impl Into<String>) -> CmdbError {
    CmdbError::SchemaDerivation {
        entity: std::any::type_name::<E>().to_string(),
        reason: reason.into(),
    }
}

fn field_role<E>(field: &FieldDescriptor<E>) -> Result<Role, CmdbError> {
    let name = field.name;
    match (&field.accessor, &field.attribute, &field.relation) {
        (_, Some(_), Some(_)) => Err(derivation_error::<E>(format!(
            "field {name} is annotated both as attribute and as relation"
        ))),
        (_, None, None) => Err(derivation_error::<E>(format!(
            "field {name} is annotated neither as attribute nor as relation"
        ))),
        (Accessor::Related { .. }, Some(_), None) => Err(derivation_error::<E>(format!(
            "field {name} holds related CIs but is annotated as attribute"
        ))),
        (Accessor::Value { .. }, None, Some(_)) => Err(derivation_error::<E>(format!(
            "field {name} holds attribute data but is annotated as relation"
        ))),
        (Accessor::Value { shape, .. }, Some(annotation), None) => {
            attribute_role::<E>(name, *shape, annotation)
        }
        (Accessor::Related { shape, .. }, None, Some(annotation)) => Ok(Role::Relation {
            predicate_id: annotation.predicate_id.clone(),
            direction: annotation.direction,
            required: !(shape.optional || annotation.optional),
        }),
    }
}

fn attribute_role<E>(
    name: &str,
    shape: FieldShape,
    annotation: &super::AttributeAnnotation,
) -> Result<Role, CmdbError> {
    let required = !(shape.optional || annotation.optional);
    if annotation.id && !required {
        return Err(derivation_error::<E>(format!(
            "ID field {name} must not be optional"
        )));
    }
    if annotation.multiline && shape.value_type != AttributeValueType::Text {
        return Err(derivation_error::<E>(format!(
            "field {name} is not text and cannot be multiline"
        )));
    }
    if annotation.name.trim().is_empty() {
        return Err(derivation_error::<E>(format!(
            "field {name} has an empty attribute name"
        )));
    }
    Ok(Role::Attribute {
        name: annotation.name.clone(),
        required,
        multiline: annotation.multiline,
    })
}

fn relation_template(shape: RelationShape, annotation: &super::RelationAnnotation) -> RelationTemplate {
    RelationTemplate::new(annotation.predicate_id.clone(), annotation.direction).with_cardinality(
        annotation.min_cardinality.or(shape.min_cardinality),
        annotation.max_cardinality.or(shape.max_cardinality),
    )
}

fn build_schema<E>(
    description: &EntityDescription<E>,
    roles: &[Role],
) -> Result<TraitSchema, CmdbError> {
    let mut builder = TraitSchema::builder(description.trait_id.clone());
    let mut id_fields = 0usize;
    for (field, role) in description.fields.iter().zip(roles) {
        match (&field.accessor, &field.attribute, &field.relation, role) {
            (
                Accessor::Value { shape, .. },
                Some(annotation),
                _,
                Role::Attribute { name, required, .. },
            ) => {
                let mut template = CiAttributeTemplate::new(
                    name.clone(),
                    effective_type(*shape, annotation.multiline),
                    shape.is_array,
                );
                if annotation.id {
                    template = template.id();
                    id_fields += 1;
                }
                for constraint in &annotation.constraints {
                    template = template.with_constraint(constraint.clone());
                }
                builder = if *required {
                    builder.required_attribute(field.name, template)
                } else {
                    builder.optional_attribute(field.name, template)
                };
            }
            (Accessor::Related { shape, .. }, _, Some(annotation), Role::Relation { required, .. }) => {
                let template = relation_template(*shape, annotation);
                builder = if *required {
                    builder.required_relation(field.name, template)
                } else {
                    builder.optional_relation(field.name, template)
                };
            }
            _ => {
                return Err(derivation_error::<E>(format!(
                    "field {} has an inconsistent annotation",
                    field.name
                )));
            }
        }
    }

    if description.singleton && id_fields > 0 {
        return Err(derivation_error::<E>("singleton entities have no ID fields"));
    }
    if !description.singleton && id_fields == 0 {
        return Err(derivation_error::<E>("no field is marked as ID"));
    }
    if id_fields > MAX_COMPOSITE_ID_FIELDS {
        return Err(derivation_error::<E>(format!(
            "{id_fields} ID fields exceed the maximum of {MAX_COMPOSITE_ID_FIELDS}"
        )));
    }
    builder.build()
}
