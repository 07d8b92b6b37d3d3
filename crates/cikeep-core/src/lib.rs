//! # cikeep-core
//!
//! The data-modeling core of the cikeep CMDB - THE LOGIC.
//!
//! CIs (configuration items) carry typed attributes and relations that are
//! written into ordered layers and versioned by changeset. Traits are
//! schemas a CI may or may not currently satisfy; typed entities map onto
//! traits and are read and written through the trait entity model.
//!
//! ## Module Map
//!
//! - `value` + `formats`: the attribute value algebra and its wire codec
//! - `schema`: trait schemas, conformance and the trait registry
//! - `entity` + `identity`: typed entities and identity resolution
//! - `store`: the storage traits with in-memory and redb backends
//! - `model`: trait-conformant reads and writes
//!
//! ## Architectural Constraints
//!
//! - Synchronous and single-threaded; callers own transactions
//! - Deterministic: ordered maps everywhere, lowest CIID wins ties
//! - Conformance is evaluated from the merged view after every write

// =============================================================================
// MODULES
// =============================================================================

pub mod entity;
pub mod formats;
pub mod identity;
pub mod model;
pub mod primitives;
pub mod schema;
pub mod store;
pub mod types;
pub mod value;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    AttributeSelection, ChangesetId, ChangesetProxy, CiId, CiSelection, CmdbError, LayerId,
    LayerSet, RelationDirection, TimeThreshold,
};

// =============================================================================
// RE-EXPORTS: Values & Formats
// =============================================================================

pub use formats::{MarshalledValue, marshal, unmarshal};
pub use value::{AttributeValue, AttributeValueType, BinaryProxy};

// =============================================================================
// RE-EXPORTS: Schema
// =============================================================================

pub use schema::{
    CiAttributeTemplate, EffectiveTrait, RelationTemplate, TraitRegistry, TraitSchema, TraitSet,
    ValueConstraint,
};

// =============================================================================
// RE-EXPORTS: Entities & Model
// =============================================================================

pub use entity::{
    AttributeAnnotation, EntityDescription, EntityReflector, FieldDescriptor, Json,
    RelationAnnotation, TraitEntity,
};
pub use identity::{Identity, IdentityResolver};
pub use model::{GenericTraitEntityModel, TraitEntityModel, WriteContext};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use store::{
    AttributeStore, CiStore, CmdbStore, MaskHandlingForRemoval, MemoryStore,
    OtherLayersValueHandling, RedbStore, Relation, RelationStore,
};
