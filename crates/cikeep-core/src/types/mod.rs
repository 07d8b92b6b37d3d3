//! # Core Type Definitions
//!
//! Identifiers and context types shared by every cikeep module:
//! - CI, layer and changeset identifiers (`CiId`, `LayerId`, `ChangesetId`)
//! - Ordered layer sets and the read/write time context
//!   (`LayerSet`, `TimeThreshold`, `ChangesetProxy`)
//! - Selections over CIs and attributes
//! - Error types (`CmdbError`)
//!
//! ## Determinism Guarantees
//!
//! Every identifier implements `Ord`, so all maps keyed by them are
//! `BTreeMap`s and iterate in a stable order. `CiId` orders by the raw
//! UUID bytes; "lowest CIID" always refers to that order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of a configuration item. The default is the nil UUID, which
/// the store never allocates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CiId(pub Uuid);

impl CiId {
    /// Allocate a fresh random CI identifier.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an identifier from its 128-bit big-endian representation.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// The 128-bit representation; ordering is preserved.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for CiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CiId {
    type Err = CmdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CmdbError::Serialization(format!("invalid CI id {s:?}: {e}")))
    }
}

/// Identifier of a layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangesetId(pub Uuid);

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// LAYER SET
// =============================================================================

/// An ordered set of layers used for reading.
///
/// The first layer has the highest precedence: when several layers hold a
/// value for the same attribute, the value of the earliest layer wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<LayerId>", into = "Vec<LayerId>")]
pub struct LayerSet(Vec<LayerId>);

impl LayerSet {
    /// Create a layer set, rejecting duplicate layers.
    pub fn new(layers: Vec<LayerId>) -> Result<Self, CmdbError> {
        let mut seen = BTreeSet::new();
        for layer in &layers {
            if !seen.insert(layer) {
                return Err(CmdbError::InvalidLayerSet(format!(
                    "layer {} appears more than once",
                    layer
                )));
            }
        }
        Ok(Self(layers))
    }

    /// A layer set holding exactly one layer.
    pub fn single(layer: LayerId) -> Self {
        Self(vec![layer])
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerId> {
        self.0.iter()
    }

    pub fn contains(&self, layer: &LayerId) -> bool {
        self.0.contains(layer)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The layers with lower precedence than `layer`.
    ///
    /// If `layer` is not part of the set, all layers are returned.
    pub fn below(&self, layer: &LayerId) -> Self {
        match self.0.iter().position(|l| l == layer) {
            Some(index) => Self(self.0[index + 1..].to_vec()),
            None => self.clone(),
        }
    }
}

impl TryFrom<Vec<LayerId>> for LayerSet {
    type Error = CmdbError;

    fn try_from(value: Vec<LayerId>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LayerSet> for Vec<LayerId> {
    fn from(value: LayerSet) -> Self {
        value.0
    }
}

// =============================================================================
// TIME CONTEXT
// =============================================================================

/// Point in time a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeThreshold {
    /// The newest state.
    #[default]
    Latest,
    /// The state as of the given instant (inclusive).
    At(DateTime<Utc>),
}

impl TimeThreshold {
    /// Whether a revision written at `timestamp` is visible.
    pub fn includes(&self, timestamp: DateTime<Utc>) -> bool {
        match self {
            Self::Latest => true,
            Self::At(threshold) => timestamp <= *threshold,
        }
    }
}

/// The write context of one logical operation.
///
/// Every revision written through a proxy carries its id and timestamp;
/// reads issued on behalf of the same operation use
/// [`ChangesetProxy::time_threshold`] so they observe those writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetProxy {
    id: ChangesetId,
    timestamp: DateTime<Utc>,
}

impl ChangesetProxy {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: ChangesetId(Uuid::new_v4()),
            timestamp,
        }
    }

    /// A changeset stamped with the current wall clock time.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    pub fn id(&self) -> ChangesetId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn time_threshold(&self) -> TimeThreshold {
        TimeThreshold::At(self.timestamp)
    }
}

// =============================================================================
// SELECTIONS
// =============================================================================

/// A selection of CIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiSelection {
    All,
    Specific(BTreeSet<CiId>),
}

impl CiSelection {
    pub fn single(ciid: CiId) -> Self {
        Self::Specific(BTreeSet::from([ciid]))
    }

    pub fn contains(&self, ciid: &CiId) -> bool {
        match self {
            Self::All => true,
            Self::Specific(set) => set.contains(ciid),
        }
    }
}

impl FromIterator<CiId> for CiSelection {
    fn from_iter<T: IntoIterator<Item = CiId>>(iter: T) -> Self {
        Self::Specific(iter.into_iter().collect())
    }
}

/// A selection of attribute names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeSelection {
    All,
    Named(BTreeSet<String>),
}

impl AttributeSelection {
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.contains(name),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for AttributeSelection {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::Named(iter.into_iter().map(Into::into).collect())
    }
}

/// Direction of a relation as seen from the CI that owns a trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationDirection {
    /// The CI is the source (`from`) of the relation.
    Forward,
    /// The CI is the target (`to`) of the relation.
    Back,
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in cikeep operations.
#[derive(Debug, Error)]
pub enum CmdbError {
    #[error("Attribute value decode error: {0}")]
    Decode(String),

    #[error("Obsolete attribute value format version {0:#04x}, data must be migrated")]
    ObsoleteFormat(u8),

    #[error("Unknown attribute value format version {0:#04x}")]
    UnknownFormatVersion(u8),

    #[error("Attribute value encode error: {0}")]
    Encode(String),

    #[error("Invalid binary proxy: {0}")]
    InvalidBinaryProxy(String),

    #[error("Invalid trait {trait_id}: {reason}")]
    InvalidTrait { trait_id: String, reason: String },

    #[error("Cannot derive trait schema for {entity}: {reason}")]
    SchemaDerivation { entity: String, reason: String },

    #[error("Missing mandatory field {field} for trait {trait_id}")]
    MissingField { trait_id: String, field: String },

    #[error("Field {field} of trait {trait_id}: {reason}")]
    FieldConversion {
        trait_id: String,
        field: String,
        reason: String,
    },

    #[error("CI {ciid} does not conform to trait requirements of {trait_id}")]
    NonConformant { trait_id: String, ciid: CiId },

    #[error("Identity {identity} occurs more than once in input for trait {trait_id}")]
    DuplicateIdentity { trait_id: String, identity: String },

    #[error("Trait {trait_id} has no relation field {field}")]
    UnknownRelationField { trait_id: String, field: String },

    #[error("Invalid layer set: {0}")]
    InvalidLayerSet(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ciid_order_follows_u128() {
        let low = CiId::from_u128(1);
        let high = CiId::from_u128(2);
        assert!(low < high);
        assert_eq!(low.as_u128(), 1);
    }

    #[test]
    fn ciid_default_is_nil() {
        assert_eq!(CiId::default().as_u128(), 0);
        assert!(CiId::default() < CiId::from_u128(1));
    }

    #[test]
    fn ciid_parse_roundtrip() {
        let id = CiId::new_random();
        let parsed: CiId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<CiId>().is_err());
    }

    #[test]
    fn layer_set_rejects_duplicates() {
        let result = LayerSet::new(vec![LayerId::new("a"), LayerId::new("a")]);
        assert!(matches!(result, Err(CmdbError::InvalidLayerSet(_))));
    }

    #[test]
    fn layer_set_below() {
        let set = LayerSet::new(vec!["a".into(), "b".into(), "c".into()]).expect("valid");
        let rest = set.below(&LayerId::new("a"));
        let names: Vec<_> = rest.iter().map(LayerId::as_str).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(set.below(&LayerId::new("c")).len(), 0);
        assert_eq!(set.below(&LayerId::new("x")).len(), 3);
    }

    #[test]
    fn time_threshold_inclusive() {
        let ts = Utc::now();
        assert!(TimeThreshold::At(ts).includes(ts));
        assert!(!TimeThreshold::At(ts).includes(ts + chrono::Duration::seconds(1)));
        assert!(TimeThreshold::Latest.includes(ts));
    }

    #[test]
    fn changeset_threshold_matches_timestamp() {
        let cs = ChangesetProxy::now();
        assert_eq!(cs.time_threshold(), TimeThreshold::At(cs.timestamp()));
    }

    #[test]
    fn selections_contain() {
        let id = CiId::from_u128(7);
        assert!(CiSelection::All.contains(&id));
        assert!(CiSelection::single(id).contains(&id));
        assert!(!CiSelection::single(id).contains(&CiId::from_u128(8)));

        let names: AttributeSelection = ["a", "b"].into_iter().collect();
        assert!(names.contains("a"));
        assert!(!names.contains("c"));
    }
}
