//! # Trait Registry
//!
//! Trait definitions are loaded into an immutable [`TraitSet`]. The
//! [`TraitRegistry`] hands out shared snapshots of the current set; an
//! update builds a complete new set and swaps it in, so readers holding an
//! older snapshot keep a consistent view.

use super::TraitSchema;
use crate::types::CmdbError;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An immutable set of validated traits, keyed by trait id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraitSet {
    traits: BTreeMap<String, Arc<TraitSchema>>,
}

#[derive(Deserialize)]
struct TraitFile {
    #[serde(default)]
    traits: Vec<TraitSchema>,
}

impl TraitSet {
    /// Validate every schema and reject duplicate trait ids.
    pub fn new(schemas: impl IntoIterator<Item = TraitSchema>) -> Result<Self, CmdbError> {
        let mut traits = BTreeMap::new();
        for schema in schemas {
            schema.validate()?;
            let id = schema.id().to_string();
            if traits.insert(id.clone(), Arc::new(schema)).is_some() {
                return Err(CmdbError::InvalidTrait {
                    trait_id: id,
                    reason: "defined more than once".to_string(),
                });
            }
        }
        Ok(Self { traits })
    }

    /// Load from TOML holding a `[[traits]]` array.
    pub fn from_toml_str(source: &str) -> Result<Self, CmdbError> {
        let file: TraitFile =
            toml::from_str(source).map_err(|e| CmdbError::Config(e.to_string()))?;
        Self::new(file.traits)
    }

    /// Load from JSON holding a `"traits"` array.
    pub fn from_json_str(source: &str) -> Result<Self, CmdbError> {
        let file: TraitFile =
            serde_json::from_str(source).map_err(|e| CmdbError::Config(e.to_string()))?;
        Self::new(file.traits)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TraitSchema>> {
        self.traits.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TraitSchema>> {
        self.traits.values()
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    /// A new set with `schema` added or replacing the trait of the same id.
    pub fn with_trait(&self, schema: TraitSchema) -> Result<Self, CmdbError> {
        schema.validate()?;
        let mut traits = self.traits.clone();
        traits.insert(schema.id().to_string(), Arc::new(schema));
        Ok(Self { traits })
    }
}

/// Holder of the current [`TraitSet`].
#[derive(Debug, Default)]
pub struct TraitRegistry {
    current: RwLock<Arc<TraitSet>>,
}

impl TraitRegistry {
    pub fn new(set: TraitSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// The current set. The snapshot stays valid across later swaps.
    pub fn snapshot(&self) -> Arc<TraitSet> {
        Arc::clone(&self.current.read())
    }

    /// Swap in `set`, returning the previous snapshot.
    pub fn replace(&self, set: TraitSet) -> Arc<TraitSet> {
        let next = Arc::new(set);
        tracing::info!(traits = next.len(), "trait set replaced");
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Derive a new set from the current one and swap it in atomically.
    pub fn update(
        &self,
        f: impl FnOnce(&TraitSet) -> Result<TraitSet, CmdbError>,
    ) -> Result<Arc<TraitSet>, CmdbError> {
        let mut guard = self.current.write();
        let next = Arc::new(f(&guard)?);
        *guard = Arc::clone(&next);
        tracing::info!(traits = next.len(), "trait set updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CiAttributeTemplate;
    use crate::value::AttributeValueType;

    const TRAITS_TOML: &str = r#"
[[traits]]
id = "host"

[[traits.required_attributes]]
identifier = "hostname"
name = "hostname"
type = "Text"
is_array = false
is_id = true

[[traits.required_attributes.constraints]]
kind = "text_length"
min = 1
max = 253

[[traits.optional_relations]]
identifier = "location"
predicate_id = "located_in"
direction = "forward"
max_cardinality = 1
"#;

    fn simple(id: &str) -> TraitSchema {
        TraitSchema::builder(id)
            .required_attribute(
                "a",
                CiAttributeTemplate::new("a", AttributeValueType::Text, false),
            )
            .build()
            .expect("schema")
    }

    #[test]
    fn load_from_toml() {
        let set = TraitSet::from_toml_str(TRAITS_TOML).expect("traits");
        let host = set.get("host").expect("host trait");
        assert_eq!(host.id_attribute_names(), vec!["hostname"]);
        assert_eq!(host.required_attributes()[0].template.constraints.len(), 1);
        assert_eq!(host.optional_relations()[0].template.max_cardinality, Some(1));
    }

    #[test]
    fn duplicate_trait_ids_rejected() {
        let result = TraitSet::new([simple("t"), simple("t")]);
        assert!(matches!(result, Err(CmdbError::InvalidTrait { .. })));
    }

    #[test]
    fn snapshots_survive_swaps() {
        let registry = TraitRegistry::new(TraitSet::new([simple("a")]).expect("set"));
        let before = registry.snapshot();

        registry
            .update(|set| set.with_trait(simple("b")))
            .expect("update");

        assert_eq!(before.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);

        let old = registry.replace(TraitSet::default());
        assert_eq!(old.len(), 2);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn failed_update_keeps_current_set() {
        let registry = TraitRegistry::new(TraitSet::new([simple("a")]).expect("set"));
        let result = registry.update(|_| Err(CmdbError::Config("boom".into())));
        assert!(result.is_err());
        assert!(registry.snapshot().get("a").is_some());
    }
}
