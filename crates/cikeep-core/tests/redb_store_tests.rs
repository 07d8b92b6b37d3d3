//! # redb Store Tests
//!
//! The trait entity model running against the persistent store.

use chrono::{Duration, TimeZone, Utc};
use cikeep_core::{
    AttributeAnnotation, AttributeSelection, AttributeStore, AttributeValue, BinaryProxy,
    ChangesetProxy, CiSelection, EntityDescription, FieldDescriptor, GenericTraitEntityModel,
    Identity, Json, LayerId, LayerSet, RedbStore, TimeThreshold, TraitEntity, WriteContext,
};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Limits {
    cpu: i64,
    memory: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Workload {
    name: String,
    description: Option<String>,
    replicas: i64,
    ratio: Option<f64>,
    labels: Option<Vec<String>>,
    limits: Option<Json<Limits>>,
    logo: Option<BinaryProxy>,
}

impl TraitEntity for Workload {
    fn describe() -> EntityDescription<Self> {
        EntityDescription::new("workload")
            .field(
                FieldDescriptor::value("name", |w: &Workload| &w.name, |w, v| w.name = v)
                    .attribute(AttributeAnnotation::new("workload.name").id()),
            )
            .field(
                FieldDescriptor::value("description", |w: &Workload| &w.description, |w, v| {
                    w.description = v
                })
                .attribute(AttributeAnnotation::new("workload.description").multiline()),
            )
            .field(
                FieldDescriptor::value("replicas", |w: &Workload| &w.replicas, |w, v| {
                    w.replicas = v
                })
                .attribute(AttributeAnnotation::new("workload.replicas")),
            )
            .field(
                FieldDescriptor::value("ratio", |w: &Workload| &w.ratio, |w, v| w.ratio = v)
                    .attribute(AttributeAnnotation::new("workload.ratio")),
            )
            .field(
                FieldDescriptor::value("labels", |w: &Workload| &w.labels, |w, v| w.labels = v)
                    .attribute(AttributeAnnotation::new("workload.labels")),
            )
            .field(
                FieldDescriptor::value("limits", |w: &Workload| &w.limits, |w, v| w.limits = v)
                    .attribute(AttributeAnnotation::new("workload.limits")),
            )
            .field(
                FieldDescriptor::value("logo", |w: &Workload| &w.logo, |w, v| w.logo = v)
                    .attribute(AttributeAnnotation::new("workload.logo")),
            )
    }
}

fn ctx(step: i64) -> WriteContext {
    let base = Utc
        .with_ymd_and_hms(2024, 9, 1, 0, 0, 0)
        .single()
        .expect("time");
    WriteContext::new(
        LayerSet::single(LayerId::new("main")),
        LayerId::new("main"),
        ChangesetProxy::new(base + Duration::seconds(step)),
    )
}

fn workload() -> Workload {
    Workload {
        name: "billing".into(),
        description: Some("line one\nline two".into()),
        replicas: 3,
        ratio: Some(0.75),
        labels: Some(vec!["team-a".into(), "".into(), "a,b".into()]),
        limits: Some(Json(Limits {
            cpu: 2,
            memory: 512,
        })),
        logo: Some(BinaryProxy::from_bytes("image/png", vec![0x89, b'P', b'N', b'G']).expect("logo")),
    }
}

#[test]
fn entity_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("cikeep.redb");
    let model = GenericTraitEntityModel::<Workload>::new().expect("model");
    let layers = LayerSet::single(LayerId::new("main"));

    {
        let mut store = RedbStore::open(&path).expect("open");
        let (written, changed) = model
            .insert_or_update(&mut store, &workload(), &ctx(1))
            .expect("insert");
        assert!(changed);
        assert_eq!(written.replicas, 3);
    }

    let store = RedbStore::open(&path).expect("reopen");
    let identity = Identity::Single(AttributeValue::text("billing"));
    let (_, read) = model
        .get_by_data_id(&store, &identity, &layers, TimeThreshold::Latest)
        .expect("read")
        .expect("present");
    let expected = workload();
    assert_eq!(read.name, expected.name);
    assert_eq!(read.description, expected.description);
    assert_eq!(read.ratio, expected.ratio);
    assert_eq!(read.labels, expected.labels);
    assert_eq!(read.limits, expected.limits);
    // Equality of images is by hash, size and mime type.
    assert_eq!(read.logo, expected.logo);

    let attributes = store
        .get_merged_attributes(
            &CiSelection::All,
            &AttributeSelection::Named(["workload.description".to_string()].into()),
            &layers,
            TimeThreshold::Latest,
        )
        .expect("attributes");
    let description = attributes
        .values()
        .next()
        .and_then(|a| a.get("workload.description"))
        .expect("description");
    assert!(matches!(description.value, AttributeValue::MultilineText(_)));
}

#[test]
fn history_and_deletion_persist() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("cikeep.redb");
    let model = GenericTraitEntityModel::<Workload>::new().expect("model");
    let layers = LayerSet::single(LayerId::new("main"));
    let identity = Identity::Single(AttributeValue::text("billing"));

    {
        let mut store = RedbStore::open(&path).expect("open");
        model
            .insert_or_update(&mut store, &workload(), &ctx(1))
            .expect("insert");
        assert!(
            model
                .try_to_delete(&mut store, &identity, &ctx(2))
                .expect("delete")
        );
    }

    let store = RedbStore::open(&path).expect("reopen");
    assert!(
        model
            .get_by_data_id(&store, &identity, &layers, TimeThreshold::Latest)
            .expect("read")
            .is_none()
    );
    let earlier = ctx(1).time_threshold();
    assert!(
        model
            .get_by_data_id(&store, &identity, &layers, earlier)
            .expect("read")
            .is_some()
    );
}
