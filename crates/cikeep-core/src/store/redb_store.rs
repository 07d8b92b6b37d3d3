//! # redb-backed Layered Store
//!
//! A persistent implementation of the storage collaborators on the redb
//! embedded database.
//!
//! Every attribute or relation write appends one revision record; nothing
//! is ever overwritten, so time-threshold reads see the state as of any
//! earlier changeset. Values are persisted as their wire triple.
//!
//! Each write runs in its own redb write transaction: the revisions of the
//! touched CI are loaded, the write is planned against them, and the new
//! revision is appended before commit.

use super::history::{
    AttributeHistory, RelationHistory, RelationMark, Revision, merge_attributes, merge_relations,
};
use super::{
    AttributeSnapshot, AttributeStore, CiStore, MaskHandlingForRemoval, MergedRelation,
    OtherLayersValueHandling, Relation, RelationSelection, RelationStore,
};
use crate::formats::{MarshalledValue, marshal};
use crate::types::{
    AttributeSelection, ChangesetId, ChangesetProxy, CiId, CiSelection, CmdbError, LayerId,
    LayerSet, TimeThreshold,
};
use crate::value::{AttributeValue, AttributeValueType};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Table for CIs: CiId(u128) -> creation time (µs since Unix epoch)
const CIS: TableDefinition<u128, i64> = TableDefinition::new("cis");

/// Table for attribute revisions: (ciid, sequence) -> serialized AttributeRecord
const ATTRIBUTE_REVISIONS: TableDefinition<(u128, u64), &[u8]> =
    TableDefinition::new("attribute_revisions");

/// Table for relation revisions: (from ciid, sequence) -> serialized RelationRecord
const RELATION_REVISIONS: TableDefinition<(u128, u64), &[u8]> =
    TableDefinition::new("relation_revisions");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_SEQUENCE: &str = "next_sequence";

fn storage(e: impl std::fmt::Display) -> CmdbError {
    CmdbError::Storage(e.to_string())
}

// =============================================================================
// RECORDS
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    value_type: AttributeValueType,
    wire: MarshalledValue,
}

#[derive(Debug, Serialize, Deserialize)]
struct RevisionHeader {
    layer: LayerId,
    changeset: u128,
    timestamp_micros: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AttributeRecord {
    name: String,
    header: RevisionHeader,
    /// `None` is a removal.
    value: Option<StoredValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RelationRecord {
    to: u128,
    predicate: String,
    header: RevisionHeader,
    /// `None` is a removal, `Some(true)` a mask.
    masked: Option<bool>,
}

impl RevisionHeader {
    fn new<V>(layer: &LayerId, revision: &Revision<V>) -> Self {
        Self {
            layer: layer.clone(),
            changeset: revision.changeset.0.as_u128(),
            timestamp_micros: revision.timestamp.timestamp_micros(),
        }
    }

    fn revision<V>(&self, state: Option<V>) -> Result<Revision<V>, CmdbError> {
        let timestamp = DateTime::<Utc>::from_timestamp_micros(self.timestamp_micros)
            .ok_or_else(|| storage(format!("invalid timestamp {}", self.timestamp_micros)))?;
        Ok(Revision {
            state,
            changeset: ChangesetId(Uuid::from_u128(self.changeset)),
            timestamp,
        })
    }
}

fn encode_attribute(
    name: &str,
    layer: &LayerId,
    revision: &Revision<AttributeValue>,
) -> Result<Vec<u8>, CmdbError> {
    let value = revision
        .state
        .as_ref()
        .map(|v| {
            Ok::<_, CmdbError>(StoredValue {
                value_type: v.value_type(),
                wire: marshal(v)?,
            })
        })
        .transpose()?;
    let record = AttributeRecord {
        name: name.to_string(),
        header: RevisionHeader::new(layer, revision),
        value,
    };
    postcard::to_allocvec(&record).map_err(|e| CmdbError::Serialization(e.to_string()))
}

fn encode_relation(
    relation: &Relation,
    layer: &LayerId,
    revision: &Revision<RelationMark>,
) -> Result<Vec<u8>, CmdbError> {
    let record = RelationRecord {
        to: relation.to.as_u128(),
        predicate: relation.predicate.clone(),
        header: RevisionHeader::new(layer, revision),
        masked: revision.state.map(|m| m == RelationMark::Mask),
    };
    postcard::to_allocvec(&record).map_err(|e| CmdbError::Serialization(e.to_string()))
}

fn load_attributes(
    table: &impl ReadableTable<(u128, u64), &'static [u8]>,
    ciid: Option<CiId>,
    history: &mut AttributeHistory,
) -> Result<(), CmdbError> {
    let entries = match ciid {
        Some(ciid) => {
            let id = ciid.as_u128();
            table.range((id, 0u64)..=(id, u64::MAX)).map_err(storage)?
        }
        None => table.iter().map_err(storage)?,
    };
    for entry in entries {
        let (key, data) = entry.map_err(storage)?;
        let (ci, _) = key.value();
        let record: AttributeRecord = postcard::from_bytes(data.value())
            .map_err(|e| CmdbError::Serialization(e.to_string()))?;
        let state = record
            .value
            .map(|stored| stored.wire.unmarshal(stored.value_type, true))
            .transpose()?;
        let revision = record.header.revision(state)?;
        history.push(
            (CiId::from_u128(ci), record.name),
            record.header.layer,
            revision,
        );
    }
    Ok(())
}

fn load_relations(
    table: &impl ReadableTable<(u128, u64), &'static [u8]>,
    from: Option<CiId>,
    history: &mut RelationHistory,
) -> Result<(), CmdbError> {
    let entries = match from {
        Some(ciid) => {
            let id = ciid.as_u128();
            table.range((id, 0u64)..=(id, u64::MAX)).map_err(storage)?
        }
        None => table.iter().map_err(storage)?,
    };
    for entry in entries {
        let (key, data) = entry.map_err(storage)?;
        let (from, _) = key.value();
        let record: RelationRecord = postcard::from_bytes(data.value())
            .map_err(|e| CmdbError::Serialization(e.to_string()))?;
        let state = record.masked.map(|masked| {
            if masked {
                RelationMark::Mask
            } else {
                RelationMark::Live
            }
        });
        let revision = record.header.revision(state)?;
        history.push(
            Relation::new(
                CiId::from_u128(from),
                CiId::from_u128(record.to),
                record.predicate,
            ),
            record.header.layer,
            revision,
        );
    }
    Ok(())
}

// =============================================================================
// STORE
// =============================================================================

/// A disk-backed layered store using redb.
pub struct RedbStore {
    /// The redb database handle.
    db: Database,
    /// Sequence number of the next revision record.
    next_sequence: u64,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore")
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CmdbError> {
        let db = Database::create(path.as_ref()).map_err(storage)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(storage)?;
            let _ = write_txn.open_table(CIS).map_err(storage)?;
            let _ = write_txn.open_table(ATTRIBUTE_REVISIONS).map_err(storage)?;
            let _ = write_txn.open_table(RELATION_REVISIONS).map_err(storage)?;
            let _ = write_txn.open_table(METADATA).map_err(storage)?;
            write_txn.commit().map_err(storage)?;
        }

        let next_sequence = {
            let read_txn = db.begin_read().map_err(storage)?;
            let table = read_txn.open_table(METADATA).map_err(storage)?;
            table
                .get(NEXT_SEQUENCE)
                .map_err(storage)?
                .map(|v| v.value())
                .unwrap_or(0)
        };

        tracing::debug!(path = %path.as_ref().display(), next_sequence, "redb store opened");
        Ok(Self { db, next_sequence })
    }

    /// Compact the database file.
    pub fn compact(&mut self) -> Result<(), CmdbError> {
        self.db.compact().map_err(storage)?;
        Ok(())
    }

    fn require_cis(write_txn: &WriteTransaction, cis: &[CiId]) -> Result<(), CmdbError> {
        let table = write_txn.open_table(CIS).map_err(storage)?;
        for ciid in cis {
            if table.get(ciid.as_u128()).map_err(storage)?.is_none() {
                return Err(CmdbError::Storage(format!("unknown CI {ciid}")));
            }
        }
        Ok(())
    }

    /// Commit `write_txn` if a revision was appended, bumping the sequence.
    fn finish(&mut self, write_txn: WriteTransaction, appended: bool) -> Result<bool, CmdbError> {
        if !appended {
            write_txn.abort().map_err(storage)?;
            return Ok(false);
        }
        let next = self.next_sequence.saturating_add(1);
        {
            let mut meta_table = write_txn.open_table(METADATA).map_err(storage)?;
            meta_table.insert(NEXT_SEQUENCE, next).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;

        // Update in-memory state only after successful commit.
        self.next_sequence = next;
        Ok(true)
    }

    /// Load the CI's attribute history, let `plan` decide on a revision and
    /// append it.
    fn append_attribute(
        &mut self,
        ciid: CiId,
        name: &str,
        layer: &LayerId,
        plan: impl FnOnce(&AttributeHistory, &(CiId, String)) -> Option<Revision<AttributeValue>>,
    ) -> Result<bool, CmdbError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        Self::require_cis(&write_txn, &[ciid])?;
        let appended = {
            let mut table = write_txn.open_table(ATTRIBUTE_REVISIONS).map_err(storage)?;
            let mut history = AttributeHistory::default();
            load_attributes(&table, Some(ciid), &mut history)?;
            match plan(&history, &(ciid, name.to_string())) {
                Some(revision) => {
                    let bytes = encode_attribute(name, layer, &revision)?;
                    table
                        .insert((ciid.as_u128(), self.next_sequence), bytes.as_slice())
                        .map_err(storage)?;
                    true
                }
                None => false,
            }
        };
        self.finish(write_txn, appended)
    }

    fn append_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        required: &[CiId],
        plan: impl FnOnce(&RelationHistory) -> Option<Revision<RelationMark>>,
    ) -> Result<bool, CmdbError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        Self::require_cis(&write_txn, required)?;
        let appended = {
            let mut table = write_txn.open_table(RELATION_REVISIONS).map_err(storage)?;
            let mut history = RelationHistory::default();
            load_relations(&table, Some(relation.from), &mut history)?;
            match plan(&history) {
                Some(revision) => {
                    let bytes = encode_relation(relation, layer, &revision)?;
                    table
                        .insert((relation.from.as_u128(), self.next_sequence), bytes.as_slice())
                        .map_err(storage)?;
                    true
                }
                None => false,
            }
        };
        self.finish(write_txn, appended)
    }
}

impl CiStore for RedbStore {
    fn create_ci(&mut self) -> Result<CiId, CmdbError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        let ciid = {
            let mut table = write_txn.open_table(CIS).map_err(storage)?;
            let mut ciid = CiId::new_random();
            while table.get(ciid.as_u128()).map_err(storage)?.is_some() {
                ciid = CiId::new_random();
            }
            table
                .insert(ciid.as_u128(), Utc::now().timestamp_micros())
                .map_err(storage)?;
            ciid
        };
        write_txn.commit().map_err(storage)?;
        tracing::debug!(%ciid, "CI created");
        Ok(ciid)
    }

    fn get_ciids(&self, selection: &CiSelection) -> Result<Vec<CiId>, CmdbError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(CIS).map_err(storage)?;
        match selection {
            CiSelection::All => {
                let mut ciids = Vec::new();
                for entry in table.iter().map_err(storage)? {
                    let (key, _) = entry.map_err(storage)?;
                    ciids.push(CiId::from_u128(key.value()));
                }
                Ok(ciids)
            }
            CiSelection::Specific(wanted) => {
                let mut ciids = Vec::with_capacity(wanted.len());
                for ciid in wanted {
                    if table.get(ciid.as_u128()).map_err(storage)?.is_some() {
                        ciids.push(*ciid);
                    }
                }
                Ok(ciids)
            }
        }
    }
}

impl AttributeStore for RedbStore {
    fn insert_attribute(
        &mut self,
        name: &str,
        value: AttributeValue,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError> {
        let written = self.append_attribute(ciid, name, layer, |history, key| {
            history.plan_insert(key, value, layer, changeset, other_layers)
        })?;
        if written {
            tracing::debug!(%ciid, name, %layer, "attribute written");
        }
        Ok(written)
    }

    fn remove_attribute(
        &mut self,
        name: &str,
        ciid: CiId,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError> {
        let removed = self.append_attribute(ciid, name, layer, |history, key| {
            history.plan_remove(key, layer, changeset, mask_handling)
        })?;
        if removed {
            tracing::debug!(%ciid, name, %layer, "attribute removed");
        }
        Ok(removed)
    }

    fn get_merged_attributes(
        &self,
        cis: &CiSelection,
        attributes: &AttributeSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<AttributeSnapshot, CmdbError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(ATTRIBUTE_REVISIONS).map_err(storage)?;
        let mut history = AttributeHistory::default();
        match cis {
            CiSelection::All => load_attributes(&table, None, &mut history)?,
            CiSelection::Specific(wanted) => {
                for ciid in wanted {
                    load_attributes(&table, Some(*ciid), &mut history)?;
                }
            }
        }
        Ok(merge_attributes(&history, history.keys(), attributes, layers, time))
    }
}

impl RelationStore for RedbStore {
    fn insert_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        other_layers: &OtherLayersValueHandling,
    ) -> Result<bool, CmdbError> {
        let endpoints = [relation.from, relation.to];
        let written = self.append_relation(relation, layer, &endpoints, |history| {
            history.plan_insert(relation, RelationMark::Live, layer, changeset, other_layers)
        })?;
        if written {
            tracing::debug!(from = %relation.from, to = %relation.to, predicate = %relation.predicate, %layer, "relation written");
        }
        Ok(written)
    }

    fn remove_relation(
        &mut self,
        relation: &Relation,
        layer: &LayerId,
        changeset: &ChangesetProxy,
        mask_handling: &MaskHandlingForRemoval,
    ) -> Result<bool, CmdbError> {
        let removed = self.append_relation(relation, layer, &[], |history| {
            history.plan_remove(relation, layer, changeset, mask_handling)
        })?;
        if removed {
            tracing::debug!(from = %relation.from, to = %relation.to, predicate = %relation.predicate, %layer, "relation removed");
        }
        Ok(removed)
    }

    fn get_merged_relations(
        &self,
        selection: &RelationSelection,
        layers: &LayerSet,
        time: TimeThreshold,
    ) -> Result<Vec<MergedRelation>, CmdbError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(RELATION_REVISIONS).map_err(storage)?;
        let mut history = RelationHistory::default();
        match selection {
            RelationSelection::From(sources) => {
                for from in sources {
                    load_relations(&table, Some(*from), &mut history)?;
                }
            }
            _ => load_relations(&table, None, &mut history)?,
        }
        Ok(merge_relations(&history, selection, layers, time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn attributes_persist_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let layer = LayerId::new("l");
        let ci = {
            let mut store = RedbStore::open(&db_path).expect("open db");
            let ci = store.create_ci().expect("ci");
            let written = store
                .insert_attribute(
                    "ports",
                    AttributeValue::IntegerArray(vec![80, 443]),
                    ci,
                    &layer,
                    &ChangesetProxy::now(),
                    &OtherLayersValueHandling::ForceWrite,
                )
                .expect("insert");
            assert!(written);
            ci
        };

        let store = RedbStore::open(&db_path).expect("reopen db");
        assert_eq!(store.get_ciids(&CiSelection::All).expect("cis"), vec![ci]);
        let snapshot = store
            .get_merged_attributes(
                &CiSelection::single(ci),
                &AttributeSelection::All,
                &LayerSet::single(layer),
                TimeThreshold::Latest,
            )
            .expect("read");
        assert_eq!(
            snapshot[&ci]["ports"].value,
            AttributeValue::IntegerArray(vec![80, 443])
        );
    }

    #[test]
    fn sequence_survives_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            let ci = store.create_ci().expect("ci");
            for value in ["a", "b"] {
                store
                    .insert_attribute(
                        "name",
                        AttributeValue::text(value),
                        ci,
                        &LayerId::new("l"),
                        &ChangesetProxy::now(),
                        &OtherLayersValueHandling::ForceWrite,
                    )
                    .expect("insert");
            }
        }
        let store = RedbStore::open(&db_path).expect("reopen db");
        assert_eq!(store.next_sequence, 2);
    }

    #[test]
    fn unchanged_write_appends_nothing() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let ci = store.create_ci().expect("ci");
        let layer = LayerId::new("l");
        let cs = ChangesetProxy::now();
        let mut write = || {
            store
                .insert_attribute(
                    "name",
                    AttributeValue::text("x"),
                    ci,
                    &layer,
                    &cs,
                    &OtherLayersValueHandling::ForceWrite,
                )
                .expect("insert")
        };
        assert!(write());
        assert!(!write());
    }

    #[test]
    fn relation_to_unknown_ci_fails() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let ci = store.create_ci().expect("ci");
        let result = store.insert_relation(
            &Relation::new(ci, CiId::from_u128(7), "p"),
            &LayerId::new("l"),
            &ChangesetProxy::now(),
            &OtherLayersValueHandling::ForceWrite,
        );
        assert!(matches!(result, Err(CmdbError::Storage(_))));
    }

    #[test]
    fn relation_masks_persist() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let a = store.create_ci().expect("ci");
        let b = store.create_ci().expect("ci");
        let relation = Relation::new(a, b, "depends_on");
        let read = LayerSet::new(vec!["top".into(), "base".into()]).expect("layers");
        let cs = ChangesetProxy::now();
        store
            .insert_relation(
                &relation,
                &LayerId::new("base"),
                &cs,
                &OtherLayersValueHandling::ForceWrite,
            )
            .expect("insert");
        let masked = store
            .remove_relation(
                &relation,
                &LayerId::new("top"),
                &cs,
                &MaskHandlingForRemoval::ApplyMaskIfNecessary(read.clone()),
            )
            .expect("remove");
        assert!(masked);

        let merged = store
            .get_merged_relations(&RelationSelection::All, &read, TimeThreshold::Latest)
            .expect("relations");
        assert!(merged.is_empty());
        let base_only = store
            .get_merged_relations(
                &RelationSelection::To(std::collections::BTreeSet::from([b])),
                &LayerSet::single(LayerId::new("base")),
                TimeThreshold::Latest,
            )
            .expect("relations");
        assert_eq!(base_only.len(), 1);
    }
}
