//! # Attribute Values
//!
//! The closed value algebra of cikeep.
//!
//! Every attribute value is exactly one variant of [`AttributeValue`]: a
//! scalar of one of the payload kinds, or a homogeneous array of one of
//! them. The variant fixes the value's [`AttributeValueType`] and whether it
//! is an array, and with those how its bytes are interpreted by the codec
//! in [`crate::formats::codec`].
//!
//! Values are immutable. They are built fresh on every read and write.
//!
//! ## Equality
//!
//! Equality is structural and array equality is element-wise and order
//! sensitive. Some payload kinds need explicit rules so that `Eq` and
//! `Hash` agree:
//! - Double: NaN equals NaN, `0.0` equals `-0.0`
//! - DateTimeWithOffset: same instant and same offset
//! - Json: structural equality, object key order ignored
//! - Yaml: same source text
//! - Image: hash, size and MIME type (payload presence ignored)

pub mod binary;

pub use binary::BinaryProxy;

use crate::primitives::ARRAY_RENDER_SEPARATOR;
use crate::types::CmdbError;
use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

// =============================================================================
// VALUE TYPE
// =============================================================================

/// The payload kind of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeValueType {
    Text,
    MultilineText,
    Integer,
    Double,
    Boolean,
    DateTimeWithOffset,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "YAML")]
    Yaml,
    Image,
    Mask,
}

impl AttributeValueType {
    pub const ALL: [Self; 10] = [
        Self::Text,
        Self::MultilineText,
        Self::Integer,
        Self::Double,
        Self::Boolean,
        Self::DateTimeWithOffset,
        Self::Json,
        Self::Yaml,
        Self::Image,
        Self::Mask,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::MultilineText => "MultilineText",
            Self::Integer => "Integer",
            Self::Double => "Double",
            Self::Boolean => "Boolean",
            Self::DateTimeWithOffset => "DateTimeWithOffset",
            Self::Json => "JSON",
            Self::Yaml => "YAML",
            Self::Image => "Image",
            Self::Mask => "Mask",
        }
    }

    /// Text and MultilineText.
    pub const fn is_text(self) -> bool {
        matches!(self, Self::Text | Self::MultilineText)
    }
}

impl fmt::Display for AttributeValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeValueType {
    type Err = CmdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CmdbError::Decode(format!("unknown attribute value type {s:?}")))
    }
}

// =============================================================================
// YAML DOCUMENT
// =============================================================================

/// A YAML payload: the source text plus its parsed form.
///
/// The source text is authoritative for rendering, encoding and equality.
#[derive(Debug, Clone)]
pub struct YamlDocument {
    source: String,
    parsed: serde_yaml::Value,
}

impl YamlDocument {
    pub fn parse(source: impl Into<String>) -> Result<Self, serde_yaml::Error> {
        let source = source.into();
        let parsed = serde_yaml::from_str(&source)?;
        Ok(Self { source, parsed })
    }

    /// Parse `source`, falling back to an error document when it is not
    /// valid YAML.
    pub fn parse_lenient(source: impl Into<String>) -> Self {
        let source = source.into();
        match serde_yaml::from_str(&source) {
            Ok(parsed) => Self { source, parsed },
            Err(e) => {
                tracing::warn!(error = %e, "YAML payload could not be parsed, storing error value");
                Self::error(&e.to_string())
            }
        }
    }

    /// The document `error: <message>`.
    pub fn error(message: &str) -> Self {
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert("error".into(), message.into());
        let parsed = serde_yaml::Value::Mapping(mapping);
        let source = serde_yaml::to_string(&parsed)
            .unwrap_or_else(|_| format!("error: {:?}\n", message));
        Self { source, parsed }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn value(&self) -> &serde_yaml::Value {
        &self.parsed
    }
}

impl PartialEq for YamlDocument {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for YamlDocument {}

impl Hash for YamlDocument {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// The JSON value `{"error": "<message>"}` that replaces unparsable JSON.
pub fn json_error_value(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

/// Parse a JSON payload, degrading to [`json_error_value`] on failure.
pub fn parse_json_lenient(text: &str) -> serde_json::Value {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "JSON payload could not be parsed, storing error value");
            json_error_value(&e.to_string())
        }
    }
}

// =============================================================================
// ATTRIBUTE VALUE
// =============================================================================

/// An attribute value: a scalar or a homogeneous array of one payload kind.
///
/// There is no Mask array; a Mask carries no payload.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Text(String),
    MultilineText(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    DateTimeWithOffset(DateTime<FixedOffset>),
    Json(serde_json::Value),
    Yaml(YamlDocument),
    Image(BinaryProxy),
    Mask,
    TextArray(Vec<String>),
    MultilineTextArray(Vec<String>),
    IntegerArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    BooleanArray(Vec<bool>),
    DateTimeWithOffsetArray(Vec<DateTime<FixedOffset>>),
    JsonArray(Vec<serde_json::Value>),
    YamlArray(Vec<YamlDocument>),
    ImageArray(Vec<BinaryProxy>),
}

impl AttributeValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn multiline_text(value: impl Into<String>) -> Self {
        Self::MultilineText(value.into())
    }

    /// A DateTimeWithOffset scalar, truncated to the 100ns precision the
    /// wire format keeps.
    pub fn date_time(value: DateTime<FixedOffset>) -> Self {
        Self::DateTimeWithOffset(truncate_to_ticks(value))
    }

    /// A JSON scalar parsed from `text`; unparsable text becomes the JSON
    /// error value.
    pub fn json_lenient(text: &str) -> Self {
        Self::Json(parse_json_lenient(text))
    }

    /// A YAML scalar parsed from `text`; unparsable text becomes the YAML
    /// error value.
    pub fn yaml_lenient(text: &str) -> Self {
        Self::Yaml(YamlDocument::parse_lenient(text))
    }

    pub fn value_type(&self) -> AttributeValueType {
        match self {
            Self::Text(_) | Self::TextArray(_) => AttributeValueType::Text,
            Self::MultilineText(_) | Self::MultilineTextArray(_) => {
                AttributeValueType::MultilineText
            }
            Self::Integer(_) | Self::IntegerArray(_) => AttributeValueType::Integer,
            Self::Double(_) | Self::DoubleArray(_) => AttributeValueType::Double,
            Self::Boolean(_) | Self::BooleanArray(_) => AttributeValueType::Boolean,
            Self::DateTimeWithOffset(_) | Self::DateTimeWithOffsetArray(_) => {
                AttributeValueType::DateTimeWithOffset
            }
            Self::Json(_) | Self::JsonArray(_) => AttributeValueType::Json,
            Self::Yaml(_) | Self::YamlArray(_) => AttributeValueType::Yaml,
            Self::Image(_) | Self::ImageArray(_) => AttributeValueType::Image,
            Self::Mask => AttributeValueType::Mask,
        }
    }

    pub fn is_array(&self) -> bool {
        match self {
            Self::Text(_)
            | Self::MultilineText(_)
            | Self::Integer(_)
            | Self::Double(_)
            | Self::Boolean(_)
            | Self::DateTimeWithOffset(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Image(_)
            | Self::Mask => false,
            Self::TextArray(_)
            | Self::MultilineTextArray(_)
            | Self::IntegerArray(_)
            | Self::DoubleArray(_)
            | Self::BooleanArray(_)
            | Self::DateTimeWithOffsetArray(_)
            | Self::JsonArray(_)
            | Self::YamlArray(_)
            | Self::ImageArray(_) => true,
        }
    }

    pub fn is_mask(&self) -> bool {
        matches!(self, Self::Mask)
    }

    /// Number of elements: the array length, or 1 for a scalar.
    pub fn element_count(&self) -> usize {
        match self {
            Self::TextArray(v) | Self::MultilineTextArray(v) => v.len(),
            Self::IntegerArray(v) => v.len(),
            Self::DoubleArray(v) => v.len(),
            Self::BooleanArray(v) => v.len(),
            Self::DateTimeWithOffsetArray(v) => v.len(),
            Self::JsonArray(v) => v.len(),
            Self::YamlArray(v) => v.len(),
            Self::ImageArray(v) => v.len(),
            _ => 1,
        }
    }

    /// The raw string form of every element, in order. Scalars yield one
    /// string.
    pub fn to_raw_strings(&self) -> Vec<String> {
        match self {
            Self::Text(s) | Self::MultilineText(s) => vec![s.clone()],
            Self::Integer(v) => vec![v.to_string()],
            Self::Double(v) => vec![v.to_string()],
            Self::Boolean(v) => vec![v.to_string()],
            Self::DateTimeWithOffset(v) => vec![v.to_rfc3339()],
            Self::Json(v) => vec![v.to_string()],
            Self::Yaml(v) => vec![v.source().to_string()],
            Self::Image(v) => vec![render_image(v)],
            Self::Mask => vec![MASK_RENDERING.to_string()],
            Self::TextArray(v) | Self::MultilineTextArray(v) => v.clone(),
            Self::IntegerArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::DoubleArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::BooleanArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::DateTimeWithOffsetArray(v) => v.iter().map(|d| d.to_rfc3339()).collect(),
            Self::JsonArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::YamlArray(v) => v.iter().map(|y| y.source().to_string()).collect(),
            Self::ImageArray(v) => v.iter().map(render_image).collect(),
        }
    }

    /// A generic, self-describing view of the value.
    pub fn to_generic(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Text(s) | Self::MultilineText(s) => J::String(s.clone()),
            Self::Integer(v) => J::from(*v),
            Self::Double(v) => J::from(*v),
            Self::Boolean(v) => J::Bool(*v),
            Self::DateTimeWithOffset(v) => J::String(v.to_rfc3339()),
            Self::Json(v) => v.clone(),
            Self::Yaml(v) => yaml_to_generic(v),
            Self::Image(v) => image_to_generic(v),
            Self::Mask => J::Null,
            Self::TextArray(v) | Self::MultilineTextArray(v) => {
                J::Array(v.iter().cloned().map(J::String).collect())
            }
            Self::IntegerArray(v) => J::Array(v.iter().copied().map(J::from).collect()),
            Self::DoubleArray(v) => J::Array(v.iter().copied().map(J::from).collect()),
            Self::BooleanArray(v) => J::Array(v.iter().copied().map(J::Bool).collect()),
            Self::DateTimeWithOffsetArray(v) => {
                J::Array(v.iter().map(|d| J::String(d.to_rfc3339())).collect())
            }
            Self::JsonArray(v) => J::Array(v.clone()),
            Self::YamlArray(v) => J::Array(v.iter().map(yaml_to_generic).collect()),
            Self::ImageArray(v) => J::Array(v.iter().map(image_to_generic).collect()),
        }
    }

    /// Build a value from raw strings (one per element).
    ///
    /// Integer, Double, Boolean and DateTimeWithOffset strings must parse;
    /// JSON and YAML degrade to their error values. Image values cannot be
    /// built from strings.
    pub fn from_raw_strings<S: AsRef<str>>(
        value_type: AttributeValueType,
        strings: &[S],
        is_array: bool,
    ) -> Result<Self, CmdbError> {
        if value_type == AttributeValueType::Mask {
            return Ok(Self::Mask);
        }
        if !is_array {
            let [single] = strings else {
                return Err(CmdbError::Decode(format!(
                    "scalar {} value needs exactly one string, got {}",
                    value_type,
                    strings.len()
                )));
            };
            let single = single.as_ref();
            return Ok(match value_type {
                AttributeValueType::Text => Self::Text(single.to_string()),
                AttributeValueType::MultilineText => Self::MultilineText(single.to_string()),
                AttributeValueType::Integer => Self::Integer(parse_integer(single)?),
                AttributeValueType::Double => Self::Double(parse_double(single)?),
                AttributeValueType::Boolean => Self::Boolean(parse_boolean(single)?),
                AttributeValueType::DateTimeWithOffset => {
                    Self::DateTimeWithOffset(parse_date_time(single)?)
                }
                AttributeValueType::Json => Self::json_lenient(single),
                AttributeValueType::Yaml => Self::yaml_lenient(single),
                AttributeValueType::Image => return Err(image_from_string()),
                AttributeValueType::Mask => Self::Mask,
            });
        }

        let items = strings.iter().map(AsRef::as_ref);
        Ok(match value_type {
            AttributeValueType::Text => Self::TextArray(items.map(str::to_string).collect()),
            AttributeValueType::MultilineText => {
                Self::MultilineTextArray(items.map(str::to_string).collect())
            }
            AttributeValueType::Integer => {
                Self::IntegerArray(items.map(parse_integer).collect::<Result<_, _>>()?)
            }
            AttributeValueType::Double => {
                Self::DoubleArray(items.map(parse_double).collect::<Result<_, _>>()?)
            }
            AttributeValueType::Boolean => {
                Self::BooleanArray(items.map(parse_boolean).collect::<Result<_, _>>()?)
            }
            AttributeValueType::DateTimeWithOffset => Self::DateTimeWithOffsetArray(
                items.map(parse_date_time).collect::<Result<_, _>>()?,
            ),
            AttributeValueType::Json => Self::JsonArray(items.map(parse_json_lenient).collect()),
            AttributeValueType::Yaml => {
                Self::YamlArray(items.map(YamlDocument::parse_lenient).collect())
            }
            AttributeValueType::Image => return Err(image_from_string()),
            AttributeValueType::Mask => Self::Mask,
        })
    }
}

const MASK_RENDERING: &str = "[masked]";

fn render_image(proxy: &BinaryProxy) -> String {
    format!("{} ({} bytes)", proxy.mime_type(), proxy.size())
}

fn image_to_generic(proxy: &BinaryProxy) -> serde_json::Value {
    serde_json::json!({
        "mime_type": proxy.mime_type(),
        "size": proxy.size(),
        "sha256": proxy.hash_hex(),
    })
}

fn yaml_to_generic(doc: &YamlDocument) -> serde_json::Value {
    serde_json::to_value(doc.value())
        .unwrap_or_else(|_| serde_json::Value::String(doc.source().to_string()))
}

fn image_from_string() -> CmdbError {
    CmdbError::Decode("Image values cannot be built from strings".to_string())
}

fn parse_integer(s: &str) -> Result<i64, CmdbError> {
    s.trim()
        .parse()
        .map_err(|e| CmdbError::Decode(format!("invalid Integer {s:?}: {e}")))
}

fn parse_double(s: &str) -> Result<f64, CmdbError> {
    s.trim()
        .parse()
        .map_err(|e| CmdbError::Decode(format!("invalid Double {s:?}: {e}")))
}

fn parse_boolean(s: &str) -> Result<bool, CmdbError> {
    match s.trim() {
        t if t.eq_ignore_ascii_case("true") => Ok(true),
        t if t.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(CmdbError::Decode(format!("invalid Boolean {s:?}"))),
    }
}

fn parse_date_time(s: &str) -> Result<DateTime<FixedOffset>, CmdbError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(truncate_to_ticks)
        .map_err(|e| CmdbError::Decode(format!("invalid DateTimeWithOffset {s:?}: {e}")))
}

/// Drop sub-100ns precision.
pub(crate) fn truncate_to_ticks(value: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let nanos = value.nanosecond();
    value.with_nanosecond(nanos - nanos % 100).unwrap_or(value)
}

// =============================================================================
// RENDERING
// =============================================================================

impl fmt::Display for AttributeValue {
    /// Scalars render as their raw string; arrays join the element strings
    /// with `,`, escaping `\` as `\\` and then each `,` as `\,`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.to_raw_strings();
        if !self.is_array() {
            return f.write_str(raw.first().map(String::as_str).unwrap_or_default());
        }
        let escaped_separator = format!("\\{}", ARRAY_RENDER_SEPARATOR);
        let joined = raw
            .iter()
            .map(|s| {
                s.replace('\\', "\\\\")
                    .replace(ARRAY_RENDER_SEPARATOR, &escaped_separator)
            })
            .collect::<Vec<_>>()
            .join(&ARRAY_RENDER_SEPARATOR.to_string());
        f.write_str(&joined)
    }
}

// =============================================================================
// EQUALITY & HASHING
// =============================================================================

fn double_key(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

fn date_time_eq(a: &DateTime<FixedOffset>, b: &DateTime<FixedOffset>) -> bool {
    a == b && a.offset() == b.offset()
}

fn slices_eq<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq(x, y))
}

fn hash_date_time<H: Hasher>(value: &DateTime<FixedOffset>, state: &mut H) {
    value.timestamp().hash(state);
    value.timestamp_subsec_nanos().hash(state);
    value.offset().local_minus_utc().hash(state);
}

/// Hash JSON so that objects hash independently of key order, matching
/// `serde_json::Value` equality.
fn hash_json<H: Hasher>(value: &serde_json::Value, state: &mut H) {
    use serde_json::Value as J;
    match value {
        J::Null => 0u8.hash(state),
        J::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        J::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        J::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        J::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        J::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, item) in entries {
                key.hash(state);
                hash_json(item, state);
            }
        }
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::MultilineText(a), Self::MultilineText(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => double_key(*a) == double_key(*b),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::DateTimeWithOffset(a), Self::DateTimeWithOffset(b)) => date_time_eq(a, b),
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Yaml(a), Self::Yaml(b)) => a == b,
            (Self::Image(a), Self::Image(b)) => a == b,
            (Self::Mask, Self::Mask) => true,
            (Self::TextArray(a), Self::TextArray(b)) => a == b,
            (Self::MultilineTextArray(a), Self::MultilineTextArray(b)) => a == b,
            (Self::IntegerArray(a), Self::IntegerArray(b)) => a == b,
            (Self::DoubleArray(a), Self::DoubleArray(b)) => {
                slices_eq(a, b, |x, y| double_key(*x) == double_key(*y))
            }
            (Self::BooleanArray(a), Self::BooleanArray(b)) => a == b,
            (Self::DateTimeWithOffsetArray(a), Self::DateTimeWithOffsetArray(b)) => {
                slices_eq(a, b, date_time_eq)
            }
            (Self::JsonArray(a), Self::JsonArray(b)) => a == b,
            (Self::YamlArray(a), Self::YamlArray(b)) => a == b,
            (Self::ImageArray(a), Self::ImageArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttributeValue {}

impl Hash for AttributeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Text(s) | Self::MultilineText(s) => s.hash(state),
            Self::Integer(v) => v.hash(state),
            Self::Double(v) => double_key(*v).hash(state),
            Self::Boolean(v) => v.hash(state),
            Self::DateTimeWithOffset(v) => hash_date_time(v, state),
            Self::Json(v) => hash_json(v, state),
            Self::Yaml(v) => v.hash(state),
            Self::Image(v) => Hash::hash(v, state),
            Self::Mask => {}
            Self::TextArray(v) | Self::MultilineTextArray(v) => v.hash(state),
            Self::IntegerArray(v) => v.hash(state),
            Self::DoubleArray(v) => {
                v.len().hash(state);
                for d in v {
                    double_key(*d).hash(state);
                }
            }
            Self::BooleanArray(v) => v.hash(state),
            Self::DateTimeWithOffsetArray(v) => {
                v.len().hash(state);
                for d in v {
                    hash_date_time(d, state);
                }
            }
            Self::JsonArray(v) => {
                v.len().hash(state);
                for j in v {
                    hash_json(j, state);
                }
            }
            Self::YamlArray(v) => v.hash(state),
            Self::ImageArray(v) => v.hash(state),
        }
    }
}
