//! # Entities
//!
//! Typed records mapped onto traits.
//!
//! An entity type implements [`TraitEntity`] by describing itself: the
//! trait it maps to and one [`FieldDescriptor`] per field, each carrying
//! accessor functions and exactly one attribute or relation annotation.
//! The [`EntityReflector`] turns such a description into a [`TraitSchema`]
//! and converts entities to and from CI data.
//!
//! ```ignore
//! impl TraitEntity for Host {
//!     fn describe() -> EntityDescription<Self> {
//!         EntityDescription::new("host")
//!             .field(
//!                 FieldDescriptor::value("hostname", |h: &Host| &h.hostname, |h, v| h.hostname = v)
//!                     .attribute(AttributeAnnotation::new("hostname").id()),
//!             )
//!             .field(
//!                 FieldDescriptor::related("rack", |h: &Host| &h.rack, |h, v| h.rack = v)
//!                     .relation(RelationAnnotation::forward("located_in")),
//!             )
//!     }
//! }
//! ```
//!
//! [`TraitSchema`]: crate::schema::TraitSchema

pub mod field;
pub mod reflector;

pub use field::{AttributeField, FieldShape, Json, RelationField, RelationShape, ScalarField};
pub use reflector::{EntityFragments, EntityReflector, RelationFragment};

use crate::schema::ValueConstraint;
use crate::types::{CiId, RelationDirection};
use crate::value::AttributeValue;
use std::fmt;

/// A record type mapped onto a trait.
///
/// `Default` provides the value of optional fields missing from CI data.
pub trait TraitEntity: Clone + Default + 'static {
    fn describe() -> EntityDescription<Self>;
}

// =============================================================================
// ANNOTATIONS
// =============================================================================

/// Marks a field as a CI attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeAnnotation {
    pub name: String,
    pub optional: bool,
    pub id: bool,
    pub multiline: bool,
    pub constraints: Vec<ValueConstraint>,
}

impl AttributeAnnotation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            id: false,
            multiline: false,
            constraints: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn id(mut self) -> Self {
        self.id = true;
        self
    }

    pub fn multiline(mut self) -> Self {
        self.multiline = true;
        self
    }

    pub fn constraint(mut self, constraint: ValueConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Marks a field as a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationAnnotation {
    pub predicate_id: String,
    pub direction: RelationDirection,
    pub optional: bool,
    pub min_cardinality: Option<usize>,
    pub max_cardinality: Option<usize>,
}

impl RelationAnnotation {
    pub fn new(predicate_id: impl Into<String>, direction: RelationDirection) -> Self {
        Self {
            predicate_id: predicate_id.into(),
            direction,
            optional: false,
            min_cardinality: None,
            max_cardinality: None,
        }
    }

    pub fn forward(predicate_id: impl Into<String>) -> Self {
        Self::new(predicate_id, RelationDirection::Forward)
    }

    pub fn back(predicate_id: impl Into<String>) -> Self {
        Self::new(predicate_id, RelationDirection::Back)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn cardinality(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_cardinality = min;
        self.max_cardinality = max;
        self
    }
}

// =============================================================================
// FIELD DESCRIPTORS
// =============================================================================

type EncodeFn<E> = Box<dyn Fn(&E, bool) -> Result<Option<AttributeValue>, String> + Send + Sync>;
type DecodeFn<E> = Box<dyn Fn(&mut E, AttributeValue) -> Result<(), String> + Send + Sync>;
type TargetsFn<E> = Box<dyn Fn(&E) -> Option<Vec<CiId>> + Send + Sync>;
type AssignFn<E> = Box<dyn Fn(&mut E, &[CiId]) -> Result<(), String> + Send + Sync>;

pub(crate) enum Accessor<E> {
    Value {
        shape: FieldShape,
        encode: EncodeFn<E>,
        decode: DecodeFn<E>,
    },
    Related {
        shape: RelationShape,
        targets: TargetsFn<E>,
        assign: AssignFn<E>,
    },
}

/// One field of an entity type.
pub struct FieldDescriptor<E> {
    pub(crate) name: &'static str,
    pub(crate) accessor: Accessor<E>,
    pub(crate) attribute: Option<AttributeAnnotation>,
    pub(crate) relation: Option<RelationAnnotation>,
}

impl<E: 'static> FieldDescriptor<E> {
    /// A field holding attribute data.
    pub fn value<T: AttributeField + 'static>(
        name: &'static str,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self {
            name,
            accessor: Accessor::Value {
                shape: T::SHAPE,
                encode: Box::new(move |entity, multiline| get(entity).encode(multiline)),
                decode: Box::new(move |entity, value| {
                    set(entity, T::decode(value)?);
                    Ok(())
                }),
            },
            attribute: None,
            relation: None,
        }
    }

    /// A field holding related CIs.
    pub fn related<T: RelationField + 'static>(
        name: &'static str,
        get: fn(&E) -> &T,
        set: fn(&mut E, T),
    ) -> Self {
        Self {
            name,
            accessor: Accessor::Related {
                shape: T::SHAPE,
                targets: Box::new(move |entity| get(entity).targets()),
                assign: Box::new(move |entity, targets| {
                    set(entity, T::from_targets(targets)?);
                    Ok(())
                }),
            },
            attribute: None,
            relation: None,
        }
    }

    pub fn attribute(mut self, annotation: AttributeAnnotation) -> Self {
        self.attribute = Some(annotation);
        self
    }

    pub fn relation(mut self, annotation: RelationAnnotation) -> Self {
        self.relation = Some(annotation);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<E> fmt::Debug for FieldDescriptor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.accessor {
            Accessor::Value { .. } => "value",
            Accessor::Related { .. } => "related",
        };
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("attribute", &self.attribute)
            .field("relation", &self.relation)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ENTITY DESCRIPTION
// =============================================================================

/// Static description of an entity type.
#[derive(Debug)]
pub struct EntityDescription<E> {
    pub(crate) trait_id: String,
    pub(crate) singleton: bool,
    pub(crate) fields: Vec<FieldDescriptor<E>>,
}

impl<E> EntityDescription<E> {
    pub fn new(trait_id: impl Into<String>) -> Self {
        Self {
            trait_id: trait_id.into(),
            singleton: false,
            fields: Vec::new(),
        }
    }

    /// Mark the trait as having at most one instance; it needs no ID.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn field(mut self, field: FieldDescriptor<E>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn trait_id(&self) -> &str {
        &self.trait_id
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }
}
