//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::config::AppConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use cikeep_core::store::{MergedAttribute, RelationSelection};
use cikeep_core::{
    AttributeSelection, AttributeStore, AttributeValue, AttributeValueType, ChangesetProxy, CiId,
    CiSelection, CiStore, CmdbError, RedbStore, RelationStore, TimeThreshold, TraitEntityModel,
    TraitSchema, WriteContext, marshal, primitives::NAME_ATTRIBUTE, unmarshal,
};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// HELPERS
// =============================================================================

fn print_json(output: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(output).unwrap_or_default()
    );
}

fn parse_value_type(value_type: &str) -> Result<AttributeValueType, CmdbError> {
    value_type.parse()
}

fn parse_ciid(ciid: &str) -> Result<CiId, CmdbError> {
    ciid.parse()
}

/// `None` reads the latest state.
fn parse_time(at: Option<&str>) -> Result<TimeThreshold, CmdbError> {
    match at {
        None => Ok(TimeThreshold::Latest),
        Some(at) => DateTime::parse_from_rfc3339(at)
            .map(|t| TimeThreshold::At(t.with_timezone(&Utc)))
            .map_err(|e| CmdbError::Config(format!("invalid timestamp {at:?}: {e}"))),
    }
}

fn decode_base64(part: &str, field: &str) -> Result<Vec<u8>, CmdbError> {
    STANDARD
        .decode(part)
        .map_err(|e| CmdbError::Decode(format!("{field} is not valid base64: {e}")))
}

/// Open the configured database, which must already exist.
fn open_store(config: &AppConfig) -> Result<RedbStore, CmdbError> {
    if !config.database.exists() {
        return Err(CmdbError::Io(format!(
            "Database {:?} not found. Run `cikeep init` first.",
            config.database
        )));
    }
    RedbStore::open(&config.database)
}

fn write_context(config: &AppConfig) -> Result<WriteContext, CmdbError> {
    Ok(WriteContext::new(
        config.layer_set()?,
        config.write_layer()?,
        ChangesetProxy::now(),
    ))
}

/// Look up a configured trait.
fn find_trait(config: &AppConfig, trait_id: &str) -> Result<std::sync::Arc<TraitSchema>, CmdbError> {
    config
        .trait_set()?
        .get(trait_id)
        .cloned()
        .ok_or_else(|| CmdbError::Config(format!("trait {trait_id:?} is not configured")))
}

fn require_ci(store: &RedbStore, ciid: CiId) -> Result<(), CmdbError> {
    if store.get_ciids(&CiSelection::single(ciid))?.is_empty() {
        return Err(CmdbError::Storage(format!("CI {ciid} does not exist")));
    }
    Ok(())
}

fn attribute_json(attribute: &MergedAttribute) -> serde_json::Value {
    serde_json::json!({
        "type": attribute.value.value_type().to_string(),
        "is_array": attribute.value.is_array(),
        "value": attribute.value.to_generic(),
        "layers": attribute.layer_stack.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        "changeset": attribute.changeset.to_string(),
    })
}

// =============================================================================
// CODEC COMMANDS
// =============================================================================

/// Encode raw strings into the wire triple.
pub fn cmd_encode(
    json_mode: bool,
    value_type: &str,
    array: bool,
    values: &[String],
) -> Result<(), CmdbError> {
    let value = AttributeValue::from_raw_strings(parse_value_type(value_type)?, values, array)?;
    let wire = marshal(&value)?;
    let binary = STANDARD.encode(&wire.binary);
    let control = STANDARD.encode(&wire.control);

    if json_mode {
        print_json(&serde_json::json!({
            "type": value.value_type().to_string(),
            "is_array": value.is_array(),
            "text": wire.text,
            "binary": binary,
            "control": control,
        }));
        return Ok(());
    }

    println!("Encoded {}{}", value.value_type(), if value.is_array() { "[]" } else { "" });
    println!("========");
    println!("Text:    {:?}", wire.text);
    println!("Binary:  {}", binary);
    println!("Control: {}", control);
    Ok(())
}

/// Decode a wire triple and render it.
pub fn cmd_decode(
    json_mode: bool,
    value_type: &str,
    text: &str,
    binary: &str,
    control: &str,
    want_full_binary: bool,
) -> Result<(), CmdbError> {
    let value_type = parse_value_type(value_type)?;
    let binary = decode_base64(binary, "binary")?;
    let control = decode_base64(control, "control")?;
    let value = unmarshal(text, &binary, &control, value_type, want_full_binary)?;

    if json_mode {
        print_json(&serde_json::json!({
            "type": value.value_type().to_string(),
            "is_array": value.is_array(),
            "elements": value.element_count(),
            "value": value.to_generic(),
        }));
        return Ok(());
    }

    println!("Decoded {}{}", value.value_type(), if value.is_array() { "[]" } else { "" });
    println!("========");
    println!("Elements: {}", value.element_count());
    println!("Value:    {}", value);
    Ok(())
}

// =============================================================================
// TRAITS COMMAND
// =============================================================================

/// List the configured traits, or show one in full.
pub fn cmd_traits(
    config: &AppConfig,
    json_mode: bool,
    trait_id: Option<&str>,
) -> Result<(), CmdbError> {
    let traits = config.trait_set()?;

    if let Some(trait_id) = trait_id {
        let schema = traits
            .get(trait_id)
            .ok_or_else(|| CmdbError::Config(format!("trait {trait_id:?} is not configured")))?;
        if json_mode {
            let output = serde_json::to_value(schema.as_ref())
                .map_err(|e| CmdbError::Serialization(e.to_string()))?;
            print_json(&output);
            return Ok(());
        }

        println!("Trait {}", schema.id());
        println!("======");
        for (attribute, required) in schema.attributes() {
            let template = &attribute.template;
            println!(
                "  {} {:<20} -> {}{}{}",
                if required { "*" } else { " " },
                attribute.identifier,
                template.name,
                template
                    .value_type
                    .map(|t| format!(" : {t}"))
                    .unwrap_or_default(),
                if template.is_id { " [id]" } else { "" },
            );
        }
        for (relation, required) in schema.relations() {
            let template = &relation.template;
            println!(
                "  {} {:<20} -> {} ({:?})",
                if required { "*" } else { " " },
                relation.identifier,
                template.predicate_id,
                template.direction,
            );
        }
        return Ok(());
    }

    if json_mode {
        let output: Vec<_> = traits
            .iter()
            .map(|schema| {
                serde_json::json!({
                    "id": schema.id(),
                    "attributes": schema.attributes().count(),
                    "relations": schema.relations().count(),
                    "id_attributes": schema.id_attribute_names(),
                })
            })
            .collect();
        print_json(&serde_json::Value::Array(output));
        return Ok(());
    }

    println!("Configured Traits");
    println!("=================");
    if traits.is_empty() {
        println!("(none)");
    }
    for schema in traits.iter() {
        println!(
            "{:<24} {} attributes, {} relations",
            schema.id(),
            schema.attributes().count(),
            schema.relations().count()
        );
    }
    Ok(())
}

// =============================================================================
// DATABASE COMMANDS
// =============================================================================

/// Initialize a new database.
pub fn cmd_init(config: &AppConfig, force: bool) -> Result<(), CmdbError> {
    let db_path = &config.database;
    if db_path.exists() {
        if !force {
            return Err(CmdbError::Io(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(db_path)
            .map_err(|e| CmdbError::Io(format!("Cannot remove {:?}: {}", db_path, e)))?;
    }

    let _store = RedbStore::open(db_path)?;
    println!("Initialized new database at {:?}", db_path);
    Ok(())
}

/// Compact the database file.
pub fn cmd_compact(config: &AppConfig) -> Result<(), CmdbError> {
    let mut store = open_store(config)?;
    store.compact()?;
    println!("Compacted {:?}", config.database);
    Ok(())
}

// =============================================================================
// CI COMMANDS
// =============================================================================

/// Allocate a CI, optionally naming it.
pub fn cmd_create_ci(
    config: &AppConfig,
    json_mode: bool,
    name: Option<&str>,
) -> Result<(), CmdbError> {
    let mut store = open_store(config)?;
    let ciid = store.create_ci()?;
    if let Some(name) = name {
        let ctx = write_context(config)?;
        store.insert_attribute(
            NAME_ATTRIBUTE,
            AttributeValue::text(name),
            ciid,
            &ctx.write_layer,
            &ctx.changeset,
            &ctx.other_layers,
        )?;
    }
    tracing::info!(%ciid, "CI created");

    if json_mode {
        print_json(&serde_json::json!({ "ciid": ciid.to_string(), "name": name }));
    } else {
        println!("{}", ciid);
    }
    Ok(())
}

/// What `set` writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeWrite {
    Value {
        value_type: String,
        array: bool,
        values: Vec<String>,
    },
    Remove,
}

/// Write or remove one attribute of a CI in the write layer.
pub fn cmd_set(
    config: &AppConfig,
    json_mode: bool,
    ciid: &str,
    attribute: &str,
    write: AttributeWrite,
) -> Result<(), CmdbError> {
    let ciid = parse_ciid(ciid)?;
    let mut store = open_store(config)?;
    require_ci(&store, ciid)?;
    let ctx = write_context(config)?;

    let changed = match write {
        AttributeWrite::Value {
            value_type,
            array,
            values,
        } => {
            let value =
                AttributeValue::from_raw_strings(parse_value_type(&value_type)?, values.as_slice(), array)?;
            store.insert_attribute(
                attribute,
                value,
                ciid,
                &ctx.write_layer,
                &ctx.changeset,
                &ctx.other_layers,
            )?
        }
        AttributeWrite::Remove => store.remove_attribute(
            attribute,
            ciid,
            &ctx.write_layer,
            &ctx.changeset,
            &ctx.mask_handling,
        )?,
    };

    if json_mode {
        print_json(&serde_json::json!({
            "ciid": ciid.to_string(),
            "attribute": attribute,
            "layer": ctx.write_layer.as_str(),
            "changeset": ctx.changeset.id().to_string(),
            "changed": changed,
        }));
    } else if changed {
        println!("{} of {} written to layer {}", attribute, ciid, ctx.write_layer);
    } else {
        println!("{} of {} unchanged", attribute, ciid);
    }
    Ok(())
}

/// Show the merged attributes and relations of a CI.
pub fn cmd_show(
    config: &AppConfig,
    json_mode: bool,
    ciid: &str,
    at: Option<&str>,
) -> Result<(), CmdbError> {
    let ciid = parse_ciid(ciid)?;
    let time = parse_time(at)?;
    let store = open_store(config)?;
    require_ci(&store, ciid)?;
    let layers = config.layer_set()?;

    let mut snapshot = store.get_merged_attributes(
        &CiSelection::single(ciid),
        &AttributeSelection::All,
        &layers,
        time,
    )?;
    let attributes = snapshot.remove(&ciid).unwrap_or_default();
    let relations = store.get_merged_relations(
        &RelationSelection::Touching(BTreeSet::from([ciid])),
        &layers,
        time,
    )?;

    if json_mode {
        let attributes: BTreeMap<_, _> = attributes
            .iter()
            .map(|(name, attribute)| (name.clone(), attribute_json(attribute)))
            .collect();
        let relations: Vec<_> = relations
            .iter()
            .map(|merged| {
                serde_json::json!({
                    "from": merged.relation.from.to_string(),
                    "predicate": merged.relation.predicate,
                    "to": merged.relation.to.to_string(),
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "ciid": ciid.to_string(),
            "attributes": attributes,
            "relations": relations,
        }));
        return Ok(());
    }

    println!("CI {}", ciid);
    println!("==");
    if attributes.is_empty() {
        println!("(no attributes)");
    }
    for (name, attribute) in &attributes {
        let layer = attribute
            .layer_stack
            .first()
            .map(|l| l.as_str())
            .unwrap_or_default();
        println!(
            "{:<28} {:<20} {} [{}]",
            name,
            attribute.value.value_type(),
            attribute.value,
            layer
        );
    }
    if !relations.is_empty() {
        println!();
        println!("Relations:");
        for merged in &relations {
            let relation = &merged.relation;
            println!("  {} -[{}]-> {}", relation.from, relation.predicate, relation.to);
        }
    }
    Ok(())
}

/// Report which configured traits a CI has, with the violations of the
/// ones it lacks.
pub fn cmd_check(
    config: &AppConfig,
    json_mode: bool,
    ciid: &str,
    trait_id: Option<&str>,
    at: Option<&str>,
) -> Result<(), CmdbError> {
    let ciid = parse_ciid(ciid)?;
    let time = parse_time(at)?;
    let schemas = match trait_id {
        Some(trait_id) => vec![find_trait(config, trait_id)?],
        None => config.trait_set()?.iter().cloned().collect(),
    };
    let store = open_store(config)?;
    require_ci(&store, ciid)?;
    let layers = config.layer_set()?;

    let mut snapshot = store.get_merged_attributes(
        &CiSelection::single(ciid),
        &AttributeSelection::All,
        &layers,
        time,
    )?;
    let attributes = snapshot.remove(&ciid);
    let relations = store.get_merged_relations(
        &RelationSelection::Touching(BTreeSet::from([ciid])),
        &layers,
        time,
    )?;
    let relations: Vec<_> = relations.iter().collect();

    let mut results = Vec::new();
    for schema in &schemas {
        let outcome = schema.check_conformance(ciid, attributes.as_ref(), &relations);
        results.push((schema.id(), outcome));
    }

    if json_mode {
        let output: Vec<_> = results
            .iter()
            .map(|(id, outcome)| match outcome {
                Ok(effective) => serde_json::json!({
                    "trait": id,
                    "conformant": true,
                    "attributes": effective
                        .attributes
                        .iter()
                        .map(|(identifier, a)| (identifier.clone(), a.value.to_generic()))
                        .collect::<serde_json::Map<_, _>>(),
                    "relations": effective
                        .relations
                        .iter()
                        .map(|(identifier, cis)| {
                            (
                                identifier.clone(),
                                serde_json::json!(cis.iter().map(CiId::to_string).collect::<Vec<_>>()),
                            )
                        })
                        .collect::<serde_json::Map<_, _>>(),
                }),
                Err(violations) => serde_json::json!({
                    "trait": id,
                    "conformant": false,
                    "violations": violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
                }),
            })
            .collect();
        print_json(&serde_json::json!({ "ciid": ciid.to_string(), "traits": output }));
        return Ok(());
    }

    println!("Traits of CI {}", ciid);
    println!("=============");
    if results.is_empty() {
        println!("(no traits configured)");
    }
    for (id, outcome) in &results {
        match outcome {
            Ok(_) => println!("[x] {}", id),
            Err(violations) => {
                println!("[ ] {}", id);
                for violation in violations {
                    println!("      {}", violation);
                }
            }
        }
    }
    Ok(())
}

/// Remove a trait from a CI.
pub fn cmd_delete(
    config: &AppConfig,
    json_mode: bool,
    ciid: &str,
    trait_id: &str,
) -> Result<(), CmdbError> {
    let ciid = parse_ciid(ciid)?;
    let model = TraitEntityModel::new(find_trait(config, trait_id)?);
    let mut store = open_store(config)?;
    require_ci(&store, ciid)?;
    let ctx = write_context(config)?;

    let deleted = model.try_to_delete(&mut store, ciid, &ctx)?;
    tracing::info!(%ciid, trait_id, deleted, "trait delete");

    if json_mode {
        print_json(&serde_json::json!({
            "ciid": ciid.to_string(),
            "trait": trait_id,
            "deleted": deleted,
        }));
    } else if deleted {
        println!("Removed trait {} from {}", trait_id, ciid);
    } else {
        println!("CI {} does not have trait {}", ciid, trait_id);
    }
    Ok(())
}
