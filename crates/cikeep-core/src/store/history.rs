//! Revision history shared by the store implementations.
//!
//! Both stores keep (or load) their data as a [`LayeredHistory`] and use it
//! to compute merged views and to decide which revision a write appends.

use super::{
    AttributeSnapshot, MaskHandlingForRemoval, MergedAttribute, MergedRelation,
    OtherLayersValueHandling, Relation, RelationSelection,
};
use crate::types::{
    AttributeSelection, ChangesetId, ChangesetProxy, CiId, LayerId, LayerSet, TimeThreshold,
};
use crate::value::AttributeValue;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::RangeFrom;

/// A state that can hide lower layers.
pub(crate) trait Maskable: Clone + PartialEq {
    fn mask() -> Self;
    fn is_mask(&self) -> bool;
}

impl Maskable for AttributeValue {
    fn mask() -> Self {
        AttributeValue::Mask
    }

    fn is_mask(&self) -> bool {
        AttributeValue::is_mask(self)
    }
}

/// State of a relation in one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelationMark {
    Live,
    Mask,
}

impl Maskable for RelationMark {
    fn mask() -> Self {
        Self::Mask
    }

    fn is_mask(&self) -> bool {
        *self == Self::Mask
    }
}

/// One write to one key in one layer. `state == None` is a removal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Revision<V> {
    pub state: Option<V>,
    pub changeset: ChangesetId,
    pub timestamp: DateTime<Utc>,
}

impl<V> Revision<V> {
    fn new(state: Option<V>, changeset: &ChangesetProxy) -> Self {
        Self {
            state,
            changeset: changeset.id(),
            timestamp: changeset.timestamp(),
        }
    }
}

/// The winning state of a key under a layer set.
pub(crate) struct Merged<'a, V> {
    pub value: &'a V,
    pub layer_stack: Vec<LayerId>,
    pub changeset: ChangesetId,
}

type LayerRevisions<V> = BTreeMap<LayerId, Vec<Revision<V>>>;

#[derive(Debug, Clone)]
pub(crate) struct LayeredHistory<K, V> {
    entries: BTreeMap<K, LayerRevisions<V>>,
}

impl<K, V> Default for LayeredHistory<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Maskable> LayeredHistory<K, V> {
    /// Append a revision; revisions of one key and layer must be pushed in
    /// write order.
    pub fn push(&mut self, key: K, layer: LayerId, revision: Revision<V>) {
        self.entries
            .entry(key)
            .or_default()
            .entry(layer)
            .or_default()
            .push(revision);
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn keys_from(&self, start: K) -> impl Iterator<Item = &K> {
        self.entries.range::<K, RangeFrom<&K>>(&start..).map(|(k, _)| k)
    }

    fn visible<'a>(
        layers: &'a LayerRevisions<V>,
        layer: &LayerId,
        time: TimeThreshold,
    ) -> Option<&'a Revision<V>> {
        layers
            .get(layer)?
            .iter()
            .rev()
            .find(|r| time.includes(r.timestamp))
    }

    /// The state of `key` in exactly `layer` at `time`.
    pub fn current(&self, key: &K, layer: &LayerId, time: TimeThreshold) -> Option<&V> {
        let layers = self.entries.get(key)?;
        Self::visible(layers, layer, time)?.state.as_ref()
    }

    /// The merged state of `key`; `None` when absent or masked.
    pub fn merged(&self, key: &K, layer_set: &LayerSet, time: TimeThreshold) -> Option<Merged<'_, V>> {
        let layers = self.entries.get(key)?;
        let mut winner: Option<&Revision<V>> = None;
        let mut layer_stack = Vec::new();
        for layer in layer_set.iter() {
            let Some(revision) = Self::visible(layers, layer, time) else {
                continue;
            };
            if revision.state.is_none() {
                continue;
            }
            layer_stack.push(layer.clone());
            winner.get_or_insert(revision);
        }
        let winner = winner?;
        let value = winner.state.as_ref()?;
        if value.is_mask() {
            return None;
        }
        Some(Merged {
            value,
            layer_stack,
            changeset: winner.changeset,
        })
    }

    /// The revision an insert of `value` must append, if any.
    pub fn plan_insert(
        &self,
        key: &K,
        value: V,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Option<Revision<V>> {
        let current = self.current(key, layer, TimeThreshold::Latest);
        if current == Some(&value) {
            return None;
        }
        if let (None, OtherLayersValueHandling::TakeIntoAccount(read_layers)) = (current, other_layers)
        {
            let below = read_layers.below(layer);
            if self
                .merged(key, &below, TimeThreshold::Latest)
                .is_some_and(|m| *m.value == value)
            {
                return None;
            }
        }
        Some(Revision::new(Some(value), changeset))
    }

    /// The revision a removal must append, if any.
    pub fn plan_remove(
        &self,
        key: &K,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Option<Revision<V>> {
        let current = self.current(key, layer, TimeThreshold::Latest);
        match mask_handling {
            MaskHandlingForRemoval::ApplyNoMask => {
                current.map(|_| Revision::new(None, changeset))
            }
            MaskHandlingForRemoval::ApplyMaskIfNecessary(read_layers) => {
                let below = read_layers.below(layer);
                let shines_through = self.merged(key, &below, TimeThreshold::Latest).is_some();
                let already_masked = current.is_some_and(Maskable::is_mask);
                match (shines_through, already_masked) {
                    (true, true) => None,
                    (true, false) => Some(Revision::new(Some(V::mask()), changeset)),
                    (false, _) => current
                        .filter(|v| !v.is_mask())
                        .map(|_| Revision::new(None, changeset)),
                }
            }
        }
    }
}

pub(crate) type AttributeHistory = LayeredHistory<(CiId, String), AttributeValue>;
pub(crate) type RelationHistory = LayeredHistory<Relation, RelationMark>;

/// Merge the attributes of every key yielded by `keys`.
pub(crate) fn merge_attributes<'a>(
    history: &'a AttributeHistory,
    keys: impl Iterator<Item = &'a (CiId, String)>,
    attributes: &AttributeSelection,
    layers: &LayerSet,
    time: TimeThreshold,
) -> AttributeSnapshot {
    let mut snapshot = AttributeSnapshot::new();
    for key in keys.filter(|(_, name)| attributes.contains(name)) {
        let Some(merged) = history.merged(key, layers, time) else {
            continue;
        };
        let (ciid, name) = key;
        snapshot.entry(*ciid).or_default().insert(
            name.clone(),
            MergedAttribute {
                ciid: *ciid,
                name: name.clone(),
                value: merged.value.clone(),
                layer_stack: merged.layer_stack,
                changeset: merged.changeset,
            },
        );
    }
    snapshot
}

/// Merge every relation of `history` matching `selection`.
pub(crate) fn merge_relations(
    history: &RelationHistory,
    selection: &RelationSelection,
    layers: &LayerSet,
    time: TimeThreshold,
) -> Vec<MergedRelation> {
    let single_source = match selection {
        RelationSelection::From(cis) if cis.len() == 1 => cis.first().copied(),
        _ => None,
    };
    let keys: Box<dyn Iterator<Item = &Relation>> = match single_source {
        Some(from) => Box::new(
            history
                .keys_from(Relation::new(from, CiId::from_u128(0), ""))
                .take_while(move |r| r.from == from),
        ),
        None => Box::new(history.keys().filter(|r| selection.matches(r))),
    };
    keys.filter_map(|relation| {
        let merged = history.merged(relation, layers, time)?;
        Some(MergedRelation {
            relation: relation.clone(),
            layer_stack: merged.layer_stack,
            changeset: merged.changeset,
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    type History = LayeredHistory<&'static str, AttributeValue>;

    fn layers(names: &[&str]) -> LayerSet {
        LayerSet::new(names.iter().map(|n| LayerId::new(*n)).collect()).expect("layers")
    }

    fn write(h: &mut History, layer: &str, value: Option<AttributeValue>, cs: &ChangesetProxy) {
        h.push("k", LayerId::new(layer), Revision::new(value, cs));
    }

    #[test]
    fn first_layer_wins() {
        let mut h = History::default();
        let cs = ChangesetProxy::now();
        write(&mut h, "top", Some(AttributeValue::Integer(1)), &cs);
        write(&mut h, "base", Some(AttributeValue::Integer(2)), &cs);

        let merged = h
            .merged(&"k", &layers(&["top", "base"]), TimeThreshold::Latest)
            .expect("merged");
        assert_eq!(merged.value, &AttributeValue::Integer(1));
        assert_eq!(merged.layer_stack.len(), 2);

        let merged = h
            .merged(&"k", &layers(&["base", "top"]), TimeThreshold::Latest)
            .expect("merged");
        assert_eq!(merged.value, &AttributeValue::Integer(2));
    }

    #[test]
    fn mask_hides_lower_layers() {
        let mut h = History::default();
        let cs = ChangesetProxy::now();
        write(&mut h, "base", Some(AttributeValue::Integer(2)), &cs);
        write(&mut h, "top", Some(AttributeValue::Mask), &cs);
        assert!(h.merged(&"k", &layers(&["top", "base"]), TimeThreshold::Latest).is_none());
        assert!(h.merged(&"k", &layers(&["base"]), TimeThreshold::Latest).is_some());
    }

    #[test]
    fn time_travel() {
        let mut h = History::default();
        let first = ChangesetProxy::now();
        let second = ChangesetProxy::new(first.timestamp() + Duration::seconds(10));
        write(&mut h, "l", Some(AttributeValue::Integer(1)), &first);
        write(&mut h, "l", None, &second);

        let l = layers(&["l"]);
        assert!(h.merged(&"k", &l, first.time_threshold()).is_some());
        assert!(h.merged(&"k", &l, second.time_threshold()).is_none());
        assert!(h.merged(&"k", &l, TimeThreshold::Latest).is_none());
    }

    #[test]
    fn insert_skips_unchanged_and_covered_values() {
        let mut h = History::default();
        let cs = ChangesetProxy::now();
        write(&mut h, "base", Some(AttributeValue::Integer(2)), &cs);
        let read = layers(&["top", "base"]);

        let covered = h.plan_insert(
            &"k",
            AttributeValue::Integer(2),
            &LayerId::new("top"),
            &cs,
            &OtherLayersValueHandling::TakeIntoAccount(read),
        );
        assert!(covered.is_none());

        let forced = h.plan_insert(
            &"k",
            AttributeValue::Integer(2),
            &LayerId::new("top"),
            &cs,
            &OtherLayersValueHandling::ForceWrite,
        );
        assert!(forced.is_some());

        let same = h.plan_insert(
            &"k",
            AttributeValue::Integer(2),
            &LayerId::new("base"),
            &cs,
            &OtherLayersValueHandling::ForceWrite,
        );
        assert!(same.is_none());
    }

    #[test]
    fn remove_masks_when_lower_layer_shines_through() {
        let mut h = History::default();
        let cs = ChangesetProxy::now();
        write(&mut h, "base", Some(AttributeValue::Integer(2)), &cs);
        let read = layers(&["top", "base"]);
        let top = LayerId::new("top");

        let masked = h
            .plan_remove(
                &"k",
                &top,
                &cs,
                &MaskHandlingForRemoval::ApplyMaskIfNecessary(read.clone()),
            )
            .expect("mask revision");
        assert_eq!(masked.state, Some(AttributeValue::Mask));

        let plain = h.plan_remove(&"k", &top, &cs, &MaskHandlingForRemoval::ApplyNoMask);
        assert!(plain.is_none());

        h.push("k", top.clone(), masked);
        let again = h.plan_remove(
            &"k",
            &top,
            &cs,
            &MaskHandlingForRemoval::ApplyMaskIfNecessary(read),
        );
        assert!(again.is_none());
    }
}
