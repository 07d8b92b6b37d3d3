//! # Property-Based Tests
//!
//! Wire codec and identity resolution invariants, checked with proptest.

use chrono::{FixedOffset, TimeZone};
use cikeep_core::store::{AttributeSnapshot, MergedAttribute};
use cikeep_core::{
    AttributeValue, AttributeValueType, BinaryProxy, ChangesetId, CiAttributeTemplate, CiId,
    Identity, IdentityResolver, LayerId, TraitSchema, marshal, unmarshal,
};
use proptest::collection::vec;
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

fn round_trip(value: &AttributeValue) -> AttributeValue {
    let wire = marshal(value).expect("marshal");
    wire.unmarshal(value.value_type(), true).expect("unmarshal")
}

fn date_time() -> impl Strategy<Value = AttributeValue> {
    (-62_000_000_000i64..250_000_000_000, 0u32..1_000_000_000, -840i32..=840).prop_map(
        |(seconds, nanos, offset_minutes)| {
            let offset = FixedOffset::east_opt(offset_minutes * 60).expect("offset in range");
            let instant = offset
                .timestamp_opt(seconds, nanos)
                .single()
                .expect("valid instant");
            AttributeValue::date_time(instant)
        },
    )
}

// =============================================================================
// CODEC PROPERTIES
// =============================================================================

proptest! {
    /// Text scalars survive marshal/unmarshal unchanged.
    #[test]
    fn text_round_trip(text in ".*") {
        let value = AttributeValue::text(text);
        prop_assert_eq!(round_trip(&value), value);
    }

    /// Text arrays keep element count, order and content, including empty
    /// elements and separator characters.
    #[test]
    fn text_array_round_trip(elements in vec("[a-z,\\\\ \n]{0,12}", 0..16)) {
        let value = AttributeValue::TextArray(elements.clone());
        let decoded = round_trip(&value);
        prop_assert_eq!(&decoded, &value);
        prop_assert_eq!(decoded.to_raw_strings(), elements);
    }

    #[test]
    fn integer_array_round_trip(elements in vec(any::<i64>(), 0..32)) {
        let value = AttributeValue::IntegerArray(elements);
        prop_assert_eq!(round_trip(&value), value);
    }

    /// Doubles are stored bit-exact.
    #[test]
    fn double_round_trip_is_bit_exact(bits in any::<u64>()) {
        let value = AttributeValue::Double(f64::from_bits(bits));
        let AttributeValue::Double(decoded) = round_trip(&value) else {
            return Err(TestCaseError::fail("wrong variant"));
        };
        prop_assert_eq!(decoded.to_bits(), bits);
    }

    #[test]
    fn boolean_array_round_trip(elements in vec(any::<bool>(), 0..64)) {
        let value = AttributeValue::BooleanArray(elements);
        prop_assert_eq!(round_trip(&value), value);
    }

    /// Timestamps keep instant and offset at tick precision.
    #[test]
    fn date_time_round_trip(value in date_time()) {
        prop_assert_eq!(round_trip(&value), value);
    }

    /// Image payloads survive with full data; metadata-only decoding keeps
    /// hash, size and mime type.
    #[test]
    fn image_round_trip(bytes in vec(any::<u8>(), 0..256), mime in "image/[a-z]{1,8}") {
        let proxy = BinaryProxy::from_bytes(mime.clone(), bytes.clone()).expect("proxy");
        let value = AttributeValue::Image(proxy.clone());
        let wire = marshal(&value).expect("marshal");

        let full = wire.unmarshal(AttributeValueType::Image, true).expect("full");
        let AttributeValue::Image(decoded) = full else {
            return Err(TestCaseError::fail("wrong variant"));
        };
        prop_assert_eq!(decoded.data(), Some(bytes.as_slice()));

        let meta = wire.unmarshal(AttributeValueType::Image, false).expect("meta");
        let AttributeValue::Image(meta) = meta else {
            return Err(TestCaseError::fail("wrong variant"));
        };
        prop_assert!(!meta.has_full_data());
        prop_assert_eq!(meta.hash(), proxy.hash());
        prop_assert_eq!(meta.size() as usize, bytes.len());
        prop_assert_eq!(meta.mime_type(), mime.as_str());
    }

    /// Every control header opens with the current format version.
    #[test]
    fn control_starts_with_version(n in any::<i64>(), array in any::<bool>()) {
        let value = if array {
            AttributeValue::IntegerArray(vec![n])
        } else {
            AttributeValue::Integer(n)
        };
        let wire = marshal(&value).expect("marshal");
        prop_assert_eq!(wire.control[0], 0x02);
        prop_assert_eq!(wire.control[1], if array { 0x02 } else { 0x01 });
    }

    /// Truncated control bytes fail to decode instead of producing data.
    #[test]
    fn truncated_control_rejected(elements in vec("[a-z]{1,4}", 1..8), cut in 1usize..6) {
        let value = AttributeValue::TextArray(elements);
        let wire = marshal(&value).expect("marshal");
        let keep = wire.control.len().saturating_sub(cut).max(2);
        prop_assume!(keep < wire.control.len());
        let result = unmarshal(
            &wire.text,
            &wire.binary,
            &wire.control[..keep],
            AttributeValueType::Text,
            true,
        );
        prop_assert!(result.is_err());
    }
}

// =============================================================================
// IDENTITY PROPERTIES
// =============================================================================

fn resolver() -> IdentityResolver {
    let schema = TraitSchema::builder("item")
        .required_attribute(
            "group",
            CiAttributeTemplate::new("item.group", AttributeValueType::Integer, false).id(),
        )
        .required_attribute(
            "name",
            CiAttributeTemplate::new("item.name", AttributeValueType::Text, false).id(),
        )
        .build()
        .expect("schema");
    IdentityResolver::new(&schema).expect("resolver")
}

fn snapshot(rows: &[(u128, i64, String)]) -> AttributeSnapshot {
    let mut snapshot = AttributeSnapshot::new();
    for (id, group, name) in rows {
        let ciid = CiId::from_u128(*id);
        let merged = |attribute: &str, value: AttributeValue| {
            (
                attribute.to_string(),
                MergedAttribute {
                    ciid,
                    name: attribute.to_string(),
                    value,
                    layer_stack: vec![LayerId::new("l")],
                    changeset: ChangesetId(Uuid::nil()),
                },
            )
        };
        let attributes: BTreeMap<_, _> = [
            merged("item.group", AttributeValue::Integer(*group)),
            merged("item.name", AttributeValue::text(name.clone())),
        ]
        .into_iter()
        .collect();
        snapshot.insert(ciid, attributes);
    }
    snapshot
}

proptest! {
    /// Resolution picks the lowest matching CIID, and bulk resolution
    /// agrees with single resolution for every identity.
    #[test]
    fn resolution_is_deterministic(
        rows in vec((1u128..200, 0i64..3, "[ab]"), 1..40),
        probes in vec((0i64..3, "[ab]"), 1..10)
    ) {
        let resolver = resolver();
        let snapshot = snapshot(&rows);
        let identities: Vec<Identity> = probes
            .iter()
            .map(|(group, name)| {
                Identity::Composite(vec![AttributeValue::Integer(*group), AttributeValue::text(name.clone())])
            })
            .collect();
        let bulk = resolver.bulk_resolve(&identities, &snapshot);

        for identity in &identities {
            let single = resolver.resolve(identity, &snapshot);
            let expected = snapshot
                .iter()
                .filter(|(_, attributes)| resolver.matches(identity, attributes))
                .map(|(ciid, _)| *ciid)
                .min();
            prop_assert_eq!(single, expected);
            prop_assert_eq!(bulk.get(identity).copied(), single);
        }
    }
}
