//! # Field Codecs
//!
//! Conversions between entity field types and attribute values.
//!
//! Every supported scalar type is available as a plain field, a `Vec`, an
//! `Option` and an `Option<Vec<_>>`. `Option` fields are optional: `None`
//! means "absent" on write and is what a missing attribute decodes to.

use crate::types::CiId;
use crate::value::{AttributeValue, AttributeValueType, BinaryProxy};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Static shape of an attribute field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldShape {
    pub value_type: AttributeValueType,
    pub is_array: bool,
    pub optional: bool,
}

/// A scalar type storable in an attribute.
pub trait ScalarField: Sized {
    const VALUE_TYPE: AttributeValueType;

    fn to_scalar(&self, multiline: bool) -> Result<AttributeValue, String>;
    fn to_array(items: &[Self], multiline: bool) -> Result<AttributeValue, String>;
    fn from_scalar(value: AttributeValue) -> Result<Self, String>;
    fn from_array(value: AttributeValue) -> Result<Vec<Self>, String>;
}

/// A field type storable in an attribute.
pub trait AttributeField: Sized {
    const SHAPE: FieldShape;

    /// The value to write, `None` when the field is absent.
    fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String>;
    fn decode(value: AttributeValue) -> Result<Self, String>;
}

fn mismatch(expected: &str, value: &AttributeValue) -> String {
    format!(
        "expected {expected}, found {}{}",
        value.value_type(),
        if value.is_array() { " array" } else { "" }
    )
}

/// Value type of a field, honoring the multiline hint on text.
pub fn effective_type(shape: FieldShape, multiline: bool) -> AttributeValueType {
    match shape.value_type {
        AttributeValueType::Text if multiline => AttributeValueType::MultilineText,
        other => other,
    }
}

macro_rules! attribute_field_shapes {
    ($t:ty) => {
        impl AttributeField for $t {
            const SHAPE: FieldShape = FieldShape {
                value_type: <$t as ScalarField>::VALUE_TYPE,
                is_array: false,
                optional: false,
            };

            fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
                self.to_scalar(multiline).map(Some)
            }

            fn decode(value: AttributeValue) -> Result<Self, String> {
                <$t as ScalarField>::from_scalar(value)
            }
        }

        impl AttributeField for Vec<$t> {
            const SHAPE: FieldShape = FieldShape {
                value_type: <$t as ScalarField>::VALUE_TYPE,
                is_array: true,
                optional: false,
            };

            fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
                <$t as ScalarField>::to_array(self, multiline).map(Some)
            }

            fn decode(value: AttributeValue) -> Result<Self, String> {
                <$t as ScalarField>::from_array(value)
            }
        }

        impl AttributeField for Option<$t> {
            const SHAPE: FieldShape = FieldShape {
                optional: true,
                ..<$t as AttributeField>::SHAPE
            };

            fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
                match self {
                    Some(v) => v.encode(multiline),
                    None => Ok(None),
                }
            }

            fn decode(value: AttributeValue) -> Result<Self, String> {
                <$t as AttributeField>::decode(value).map(Some)
            }
        }

        impl AttributeField for Option<Vec<$t>> {
            const SHAPE: FieldShape = FieldShape {
                optional: true,
                ..<Vec<$t> as AttributeField>::SHAPE
            };

            fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
                match self {
                    Some(v) => v.encode(multiline),
                    None => Ok(None),
                }
            }

            fn decode(value: AttributeValue) -> Result<Self, String> {
                <Vec<$t> as AttributeField>::decode(value).map(Some)
            }
        }
    };
}

// =============================================================================
// SCALARS
// =============================================================================

impl ScalarField for String {
    const VALUE_TYPE: AttributeValueType = AttributeValueType::Text;

    fn to_scalar(&self, multiline: bool) -> Result<AttributeValue, String> {
        Ok(if multiline {
            AttributeValue::MultilineText(self.clone())
        } else {
            AttributeValue::Text(self.clone())
        })
    }

    fn to_array(items: &[Self], multiline: bool) -> Result<AttributeValue, String> {
        Ok(if multiline {
            AttributeValue::MultilineTextArray(items.to_vec())
        } else {
            AttributeValue::TextArray(items.to_vec())
        })
    }

    fn from_scalar(value: AttributeValue) -> Result<Self, String> {
        match value {
            AttributeValue::Text(s) | AttributeValue::MultilineText(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }

    fn from_array(value: AttributeValue) -> Result<Vec<Self>, String> {
        match value {
            AttributeValue::TextArray(v) | AttributeValue::MultilineTextArray(v) => Ok(v),
            other => Err(mismatch("text array", &other)),
        }
    }
}

/// Scalars mapping onto exactly one value variant pair.
macro_rules! plain_scalar_field {
    ($t:ty, $value_type:ident, $scalar:ident, $array:ident, $label:literal) => {
        impl ScalarField for $t {
            const VALUE_TYPE: AttributeValueType = AttributeValueType::$value_type;

            fn to_scalar(&self, _multiline: bool) -> Result<AttributeValue, String> {
                Ok(AttributeValue::$scalar(Clone::clone(self)))
            }

            fn to_array(items: &[Self], _multiline: bool) -> Result<AttributeValue, String> {
                Ok(AttributeValue::$array(items.to_vec()))
            }

            fn from_scalar(value: AttributeValue) -> Result<Self, String> {
                match value {
                    AttributeValue::$scalar(v) => Ok(v),
                    other => Err(mismatch($label, &other)),
                }
            }

            fn from_array(value: AttributeValue) -> Result<Vec<Self>, String> {
                match value {
                    AttributeValue::$array(v) => Ok(v),
                    other => Err(mismatch(concat!($label, " array"), &other)),
                }
            }
        }
    };
}

plain_scalar_field!(i64, Integer, Integer, IntegerArray, "integer");
plain_scalar_field!(f64, Double, Double, DoubleArray, "double");
plain_scalar_field!(bool, Boolean, Boolean, BooleanArray, "boolean");
plain_scalar_field!(serde_json::Value, Json, Json, JsonArray, "JSON");
plain_scalar_field!(BinaryProxy, Image, Image, ImageArray, "image");

impl ScalarField for DateTime<FixedOffset> {
    const VALUE_TYPE: AttributeValueType = AttributeValueType::DateTimeWithOffset;

    fn to_scalar(&self, _multiline: bool) -> Result<AttributeValue, String> {
        Ok(AttributeValue::date_time(*self))
    }

    fn to_array(items: &[Self], _multiline: bool) -> Result<AttributeValue, String> {
        Ok(AttributeValue::DateTimeWithOffsetArray(
            items
                .iter()
                .map(|dt| crate::value::truncate_to_ticks(*dt))
                .collect(),
        ))
    }

    fn from_scalar(value: AttributeValue) -> Result<Self, String> {
        match value {
            AttributeValue::DateTimeWithOffset(v) => Ok(v),
            other => Err(mismatch("timestamp", &other)),
        }
    }

    fn from_array(value: AttributeValue) -> Result<Vec<Self>, String> {
        match value {
            AttributeValue::DateTimeWithOffsetArray(v) => Ok(v),
            other => Err(mismatch("timestamp array", &other)),
        }
    }
}

attribute_field_shapes!(String);
attribute_field_shapes!(i64);
attribute_field_shapes!(f64);
attribute_field_shapes!(bool);
attribute_field_shapes!(DateTime<FixedOffset>);
attribute_field_shapes!(serde_json::Value);
attribute_field_shapes!(BinaryProxy);

// =============================================================================
// JSON-SERIALIZED FIELDS
// =============================================================================

/// A field of any serde type, stored as a JSON attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Json<T>(pub T);

impl<T: Serialize + DeserializeOwned> Json<T> {
    fn to_json(&self) -> Result<serde_json::Value, String> {
        serde_json::to_value(&self.0).map_err(|e| e.to_string())
    }

    fn from_json(value: serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value).map(Json).map_err(|e| e.to_string())
    }
}

impl<T: Serialize + DeserializeOwned> ScalarField for Json<T> {
    const VALUE_TYPE: AttributeValueType = AttributeValueType::Json;

    fn to_scalar(&self, _multiline: bool) -> Result<AttributeValue, String> {
        self.to_json().map(AttributeValue::Json)
    }

    fn to_array(items: &[Self], _multiline: bool) -> Result<AttributeValue, String> {
        items
            .iter()
            .map(Json::<T>::to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::JsonArray)
    }

    fn from_scalar(value: AttributeValue) -> Result<Self, String> {
        match value {
            AttributeValue::Json(v) => Json::<T>::from_json(v),
            other => Err(mismatch("JSON", &other)),
        }
    }

    fn from_array(value: AttributeValue) -> Result<Vec<Self>, String> {
        match value {
            AttributeValue::JsonArray(items) => items.into_iter().map(Json::<T>::from_json).collect(),
            other => Err(mismatch("JSON array", &other)),
        }
    }
}

impl<T: Serialize + DeserializeOwned> AttributeField for Json<T> {
    const SHAPE: FieldShape = FieldShape {
        value_type: AttributeValueType::Json,
        is_array: false,
        optional: false,
    };

    fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
        self.to_scalar(multiline).map(Some)
    }

    fn decode(value: AttributeValue) -> Result<Self, String> {
        Self::from_scalar(value)
    }
}

impl<T: Serialize + DeserializeOwned> AttributeField for Vec<Json<T>> {
    const SHAPE: FieldShape = FieldShape {
        is_array: true,
        ..<Json<T> as AttributeField>::SHAPE
    };

    fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
        <Json<T> as ScalarField>::to_array(self, multiline).map(Some)
    }

    fn decode(value: AttributeValue) -> Result<Self, String> {
        <Json<T> as ScalarField>::from_array(value)
    }
}

impl<T: Serialize + DeserializeOwned> AttributeField for Option<Json<T>> {
    const SHAPE: FieldShape = FieldShape {
        optional: true,
        ..<Json<T> as AttributeField>::SHAPE
    };

    fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
        match self {
            Some(v) => v.encode(multiline),
            None => Ok(None),
        }
    }

    fn decode(value: AttributeValue) -> Result<Self, String> {
        <Json<T> as AttributeField>::decode(value).map(Some)
    }
}

impl<T: Serialize + DeserializeOwned> AttributeField for Option<Vec<Json<T>>> {
    const SHAPE: FieldShape = FieldShape {
        optional: true,
        ..<Vec<Json<T>> as AttributeField>::SHAPE
    };

    fn encode(&self, multiline: bool) -> Result<Option<AttributeValue>, String> {
        match self {
            Some(v) => v.encode(multiline),
            None => Ok(None),
        }
    }

    fn decode(value: AttributeValue) -> Result<Self, String> {
        <Vec<Json<T>> as AttributeField>::decode(value).map(Some)
    }
}

// =============================================================================
// RELATION FIELDS
// =============================================================================

/// Static shape of a relation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationShape {
    pub optional: bool,
    pub min_cardinality: Option<usize>,
    pub max_cardinality: Option<usize>,
}

/// A field type holding related CIs.
pub trait RelationField: Sized {
    const SHAPE: RelationShape;

    /// Related CIs to write, `None` when the field is absent.
    fn targets(&self) -> Option<Vec<CiId>>;
    fn from_targets(targets: &[CiId]) -> Result<Self, String>;
}

impl RelationField for CiId {
    const SHAPE: RelationShape = RelationShape {
        optional: false,
        min_cardinality: Some(1),
        max_cardinality: Some(1),
    };

    fn targets(&self) -> Option<Vec<CiId>> {
        Some(vec![*self])
    }

    fn from_targets(targets: &[CiId]) -> Result<Self, String> {
        match targets {
            [single] => Ok(*single),
            other => Err(format!("expected exactly one related CI, found {}", other.len())),
        }
    }
}

impl RelationField for Option<CiId> {
    const SHAPE: RelationShape = RelationShape {
        optional: true,
        min_cardinality: None,
        max_cardinality: Some(1),
    };

    fn targets(&self) -> Option<Vec<CiId>> {
        self.map(|ciid| vec![ciid])
    }

    fn from_targets(targets: &[CiId]) -> Result<Self, String> {
        match targets {
            [] => Ok(None),
            [single] => Ok(Some(*single)),
            other => Err(format!("expected at most one related CI, found {}", other.len())),
        }
    }
}

impl RelationField for Vec<CiId> {
    const SHAPE: RelationShape = RelationShape {
        optional: false,
        min_cardinality: None,
        max_cardinality: None,
    };

    fn targets(&self) -> Option<Vec<CiId>> {
        Some(self.clone())
    }

    fn from_targets(targets: &[CiId]) -> Result<Self, String> {
        Ok(targets.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Endpoint {
        host: String,
        port: u16,
    }

    #[test]
    fn optional_none_encodes_absent() {
        let absent: Option<i64> = None;
        assert_eq!(absent.encode(false).expect("encode"), None);
        assert!(<Option<i64> as AttributeField>::SHAPE.optional);
        assert!(!<i64 as AttributeField>::SHAPE.optional);
    }

    #[test]
    fn multiline_hint_selects_variant() {
        let text = "a\nb".to_string();
        assert_eq!(
            text.encode(true).expect("encode"),
            Some(AttributeValue::multiline_text("a\nb"))
        );
        let shape = <String as AttributeField>::SHAPE;
        assert_eq!(effective_type(shape, true), AttributeValueType::MultilineText);
        // Either text flavour decodes into a String.
        assert_eq!(
            String::decode(AttributeValue::multiline_text("x")).expect("decode"),
            "x"
        );
    }

    #[test]
    fn array_shape_is_enforced_on_decode() {
        let result = <Vec<i64> as AttributeField>::decode(AttributeValue::Integer(1));
        assert!(result.is_err());
        let values = <Vec<i64> as AttributeField>::decode(AttributeValue::IntegerArray(vec![1, 2]))
            .expect("decode");
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn json_fields_round_trip_through_serde() {
        let endpoint = Json(Endpoint {
            host: "db".into(),
            port: 5432,
        });
        let value = endpoint.encode(false).expect("encode").expect("present");
        assert_eq!(
            value,
            AttributeValue::Json(serde_json::json!({"host": "db", "port": 5432}))
        );
        let decoded = Json::<Endpoint>::decode(value).expect("decode");
        assert_eq!(decoded, endpoint);

        let wrong = Json::<Endpoint>::decode(AttributeValue::Json(serde_json::json!([1])));
        assert!(wrong.is_err());
    }

    #[test]
    fn relation_cardinality_of_field_types() {
        let a = CiId::from_u128(1);
        let b = CiId::from_u128(2);
        assert_eq!(CiId::from_targets(&[a]).expect("one"), a);
        assert!(CiId::from_targets(&[a, b]).is_err());
        assert_eq!(Option::<CiId>::from_targets(&[]).expect("none"), None);
        assert_eq!(None::<CiId>.targets(), None);
        assert_eq!(Vec::<CiId>::from_targets(&[a, b]).expect("many"), vec![a, b]);
    }
}
