//! # Attribute Value Wire Format
//!
//! Marshal/unmarshal of [`AttributeValue`]s into the persisted
//! (`text`, `binary`, `control`) triple.
//!
//! Format version 2:
//! - `control[0]`: format version (`0x02`)
//! - `control[1]`: `0x01` scalar, `0x02` array
//! - all integers are 4-byte little-endian signed
//!
//! Per payload kind:
//! - Text, MultilineText, Integer, JSON, YAML: rendered text in `text`.
//!   Arrays concatenate the elements; `control` carries the element count
//!   and one length per element, counted in UTF-16 code units.
//! - Double, Boolean, DateTimeWithOffset: fixed-width little-endian
//!   elements in `binary`. Arrays add the element count to `control`.
//! - Image: `control` carries per element the payload size, the raw
//!   32-byte SHA-256 hash and the MIME type (length-prefixed UTF-8). Arrays
//!   group the fields: count, all sizes, all hashes, all MIME lengths, all
//!   MIME bytes. `binary` carries the concatenated payloads.
//! - Mask: header only.
//!
//! Decoding is strict: unknown versions, truncated or trailing control
//! bytes and payload size mismatches are errors. The one exception is JSON
//! and YAML text that does not parse, which decodes to the respective
//! error value.

use crate::primitives::{
    ARRAY_MARKER, BOOLEAN_WIDTH, CONTROL_HEADER_LEN, DATE_TIME_WIDTH, DOUBLE_WIDTH,
    FORMAT_VERSION, HASH_LENGTH, MAX_ARRAY_ELEMENTS, OBSOLETE_FORMAT_VERSION, SCALAR_MARKER,
    TICKS_EPOCH_OFFSET_SECONDS, TICKS_PER_SECOND,
};
use crate::types::CmdbError;
use crate::value::{
    AttributeValue, AttributeValueType, BinaryProxy, YamlDocument, parse_json_lenient,
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// MARSHALLED VALUE
// =============================================================================

/// The persisted representation of one attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarshalledValue {
    pub text: String,
    pub binary: Vec<u8>,
    pub control: Vec<u8>,
}

impl MarshalledValue {
    /// Decode this triple as a value of `value_type`.
    pub fn unmarshal(
        &self,
        value_type: AttributeValueType,
        want_full_binary: bool,
    ) -> Result<AttributeValue, CmdbError> {
        unmarshal(
            &self.text,
            &self.binary,
            &self.control,
            value_type,
            want_full_binary,
        )
    }
}

// =============================================================================
// MARSHAL
// =============================================================================

/// Encode a value into its wire triple.
///
/// Fails for Image values whose payload is not loaded.
pub fn marshal(value: &AttributeValue) -> Result<MarshalledValue, CmdbError> {
    match value {
        AttributeValue::Text(s) | AttributeValue::MultilineText(s) => Ok(text_scalar(s.clone())),
        AttributeValue::Integer(v) => Ok(text_scalar(v.to_string())),
        AttributeValue::Json(v) => Ok(text_scalar(v.to_string())),
        AttributeValue::Yaml(v) => Ok(text_scalar(v.source().to_string())),
        AttributeValue::TextArray(v) | AttributeValue::MultilineTextArray(v) => {
            text_array(v.iter().map(String::as_str))
        }
        AttributeValue::IntegerArray(v) => {
            let rendered: Vec<String> = v.iter().map(ToString::to_string).collect();
            text_array(rendered.iter().map(String::as_str))
        }
        AttributeValue::JsonArray(v) => {
            let rendered: Vec<String> = v.iter().map(ToString::to_string).collect();
            text_array(rendered.iter().map(String::as_str))
        }
        AttributeValue::YamlArray(v) => text_array(v.iter().map(YamlDocument::source)),

        AttributeValue::Double(v) => Ok(binary_scalar(v.to_le_bytes().to_vec())),
        AttributeValue::Boolean(v) => Ok(binary_scalar(vec![u8::from(*v)])),
        AttributeValue::DateTimeWithOffset(v) => Ok(binary_scalar(encode_date_time(v)?.to_vec())),
        AttributeValue::DoubleArray(v) => {
            binary_array(v.len(), v.iter().flat_map(|d| d.to_le_bytes()).collect())
        }
        AttributeValue::BooleanArray(v) => {
            binary_array(v.len(), v.iter().map(|b| u8::from(*b)).collect())
        }
        AttributeValue::DateTimeWithOffsetArray(v) => {
            let mut binary = Vec::with_capacity(v.len().saturating_mul(DATE_TIME_WIDTH));
            for d in v {
                binary.extend_from_slice(&encode_date_time(d)?);
            }
            binary_array(v.len(), binary)
        }

        AttributeValue::Image(proxy) => {
            let mut control = header(false);
            push_len(&mut control, proxy.size() as usize)?;
            control.extend_from_slice(proxy.hash());
            push_len(&mut control, proxy.mime_type().len())?;
            control.extend_from_slice(proxy.mime_type().as_bytes());
            Ok(MarshalledValue {
                text: String::new(),
                binary: image_payload(proxy)?.to_vec(),
                control,
            })
        }
        AttributeValue::ImageArray(proxies) => {
            let mut control = header(true);
            push_len(&mut control, proxies.len())?;
            for proxy in proxies {
                push_len(&mut control, proxy.size() as usize)?;
            }
            for proxy in proxies {
                control.extend_from_slice(proxy.hash());
            }
            for proxy in proxies {
                push_len(&mut control, proxy.mime_type().len())?;
            }
            for proxy in proxies {
                control.extend_from_slice(proxy.mime_type().as_bytes());
            }
            let mut binary = Vec::new();
            for proxy in proxies {
                binary.extend_from_slice(image_payload(proxy)?);
            }
            Ok(MarshalledValue {
                text: String::new(),
                binary,
                control,
            })
        }

        AttributeValue::Mask => Ok(text_scalar(String::new())),
    }
}

fn header(is_array: bool) -> Vec<u8> {
    vec![
        FORMAT_VERSION,
        if is_array { ARRAY_MARKER } else { SCALAR_MARKER },
    ]
}

fn push_len(control: &mut Vec<u8>, len: usize) -> Result<(), CmdbError> {
    let len = i32::try_from(len)
        .map_err(|_| CmdbError::Encode(format!("length {} does not fit the wire format", len)))?;
    control.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn text_scalar(text: String) -> MarshalledValue {
    MarshalledValue {
        text,
        binary: Vec::new(),
        control: header(false),
    }
}

fn text_array<'a>(elements: impl ExactSizeIterator<Item = &'a str>) -> Result<MarshalledValue, CmdbError> {
    let mut control = header(true);
    push_len(&mut control, elements.len())?;
    let mut text = String::new();
    for element in elements {
        push_len(&mut control, element.encode_utf16().count())?;
        text.push_str(element);
    }
    Ok(MarshalledValue {
        text,
        binary: Vec::new(),
        control,
    })
}

fn binary_scalar(binary: Vec<u8>) -> MarshalledValue {
    MarshalledValue {
        text: String::new(),
        binary,
        control: header(false),
    }
}

fn binary_array(count: usize, binary: Vec<u8>) -> Result<MarshalledValue, CmdbError> {
    let mut control = header(true);
    push_len(&mut control, count)?;
    Ok(MarshalledValue {
        text: String::new(),
        binary,
        control,
    })
}

fn image_payload(proxy: &BinaryProxy) -> Result<&[u8], CmdbError> {
    proxy.data().ok_or_else(|| {
        CmdbError::Encode(format!(
            "image {} has no payload loaded",
            proxy.hash_hex()
        ))
    })
}

fn encode_date_time(value: &DateTime<FixedOffset>) -> Result<[u8; DATE_TIME_WIDTH], CmdbError> {
    let out_of_range = || CmdbError::Encode(format!("timestamp {} out of range", value));
    let sub_ticks = i64::from(value.timestamp_subsec_nanos() / 100);
    let ticks = value
        .timestamp()
        .checked_add(TICKS_EPOCH_OFFSET_SECONDS)
        .and_then(|s| s.checked_mul(TICKS_PER_SECOND))
        .and_then(|t| t.checked_add(sub_ticks))
        .ok_or_else(out_of_range)?;
    let offset_minutes = i16::try_from(value.offset().local_minus_utc() / 60)
        .map_err(|_| out_of_range())?;

    let mut out = [0u8; DATE_TIME_WIDTH];
    out[..8].copy_from_slice(&ticks.to_le_bytes());
    out[8..].copy_from_slice(&offset_minutes.to_le_bytes());
    Ok(out)
}

// =============================================================================
// UNMARSHAL
// =============================================================================

/// Decode a wire triple as a value of `value_type`.
///
/// With `want_full_binary == false`, Image values decode to metadata-only
/// proxies and `binary` is not inspected.
pub fn unmarshal(
    text: &str,
    binary: &[u8],
    control: &[u8],
    value_type: AttributeValueType,
    want_full_binary: bool,
) -> Result<AttributeValue, CmdbError> {
    let (is_array, mut reader) = ControlReader::open(control)?;

    match value_type {
        AttributeValueType::Mask => Ok(AttributeValue::Mask),
        AttributeValueType::Text
        | AttributeValueType::MultilineText
        | AttributeValueType::Integer
        | AttributeValueType::Json
        | AttributeValueType::Yaml => {
            if !is_array {
                reader.finish()?;
                return text_value(value_type, text);
            }
            let count = reader.read_count()?;
            let mut lengths = Vec::with_capacity(count);
            for _ in 0..count {
                lengths.push(reader.read_len()?);
            }
            reader.finish()?;
            let elements = split_utf16(text, &lengths)?;
            text_array_value(value_type, elements)
        }
        AttributeValueType::Double
        | AttributeValueType::Boolean
        | AttributeValueType::DateTimeWithOffset => {
            let width = match value_type {
                AttributeValueType::Double => DOUBLE_WIDTH,
                AttributeValueType::Boolean => BOOLEAN_WIDTH,
                _ => DATE_TIME_WIDTH,
            };
            let count = if is_array { reader.read_count()? } else { 1 };
            reader.finish()?;
            let expected = count
                .checked_mul(width)
                .ok_or_else(|| CmdbError::Decode("element count overflows".to_string()))?;
            if binary.len() != expected {
                return Err(CmdbError::Decode(format!(
                    "{} payload has {} bytes, expected {}",
                    value_type,
                    binary.len(),
                    expected
                )));
            }
            fixed_width_value(value_type, binary.chunks_exact(width), is_array)
        }
        AttributeValueType::Image => {
            if is_array {
                image_array(reader, binary, want_full_binary)
            } else {
                image_scalar(reader, binary, want_full_binary)
            }
        }
    }
}

fn text_value(value_type: AttributeValueType, text: &str) -> Result<AttributeValue, CmdbError> {
    Ok(match value_type {
        AttributeValueType::MultilineText => AttributeValue::MultilineText(text.to_string()),
        AttributeValueType::Integer => AttributeValue::Integer(decode_integer(text)?),
        AttributeValueType::Json => AttributeValue::Json(parse_json_lenient(text)),
        AttributeValueType::Yaml => AttributeValue::Yaml(YamlDocument::parse_lenient(text)),
        _ => AttributeValue::Text(text.to_string()),
    })
}

fn text_array_value(
    value_type: AttributeValueType,
    elements: Vec<String>,
) -> Result<AttributeValue, CmdbError> {
    Ok(match value_type {
        AttributeValueType::MultilineText => AttributeValue::MultilineTextArray(elements),
        AttributeValueType::Integer => AttributeValue::IntegerArray(
            elements
                .iter()
                .map(|e| decode_integer(e))
                .collect::<Result<_, _>>()?,
        ),
        AttributeValueType::Json => {
            AttributeValue::JsonArray(elements.iter().map(|e| parse_json_lenient(e)).collect())
        }
        AttributeValueType::Yaml => {
            AttributeValue::YamlArray(elements.into_iter().map(YamlDocument::parse_lenient).collect())
        }
        _ => AttributeValue::TextArray(elements),
    })
}

fn decode_integer(text: &str) -> Result<i64, CmdbError> {
    text.parse()
        .map_err(|e| CmdbError::Decode(format!("invalid Integer text {text:?}: {e}")))
}

fn fixed_width_value<'a>(
    value_type: AttributeValueType,
    chunks: impl Iterator<Item = &'a [u8]>,
    is_array: bool,
) -> Result<AttributeValue, CmdbError> {
    match value_type {
        AttributeValueType::Double => {
            let values: Vec<f64> = chunks
                .map(|c| le_array::<8>(c).map(f64::from_le_bytes))
                .collect::<Result<_, _>>()?;
            Ok(scalar_or_array(values, is_array, AttributeValue::Double, AttributeValue::DoubleArray))
        }
        AttributeValueType::Boolean => {
            let values: Vec<bool> = chunks.map(|c| c.iter().any(|b| *b != 0)).collect();
            Ok(scalar_or_array(values, is_array, AttributeValue::Boolean, AttributeValue::BooleanArray))
        }
        _ => {
            let values: Vec<DateTime<FixedOffset>> =
                chunks.map(decode_date_time).collect::<Result<_, _>>()?;
            Ok(scalar_or_array(
                values,
                is_array,
                AttributeValue::DateTimeWithOffset,
                AttributeValue::DateTimeWithOffsetArray,
            ))
        }
    }
}

fn scalar_or_array<T>(
    mut values: Vec<T>,
    is_array: bool,
    scalar: impl FnOnce(T) -> AttributeValue,
    array: impl FnOnce(Vec<T>) -> AttributeValue,
) -> AttributeValue {
    if is_array {
        return array(values);
    }
    match values.pop() {
        Some(value) => scalar(value),
        None => array(values),
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CmdbError> {
    bytes
        .try_into()
        .map_err(|_| CmdbError::Decode(format!("expected {} bytes, got {}", N, bytes.len())))
}

fn decode_date_time(bytes: &[u8]) -> Result<DateTime<FixedOffset>, CmdbError> {
    let ticks = i64::from_le_bytes(le_array::<8>(&bytes[..8.min(bytes.len())])?);
    let offset_minutes = i16::from_le_bytes(le_array::<2>(bytes.get(8..).unwrap_or_default())?);

    let out_of_range = || CmdbError::Decode(format!("timestamp ticks {} out of range", ticks));
    let seconds = ticks
        .div_euclid(TICKS_PER_SECOND)
        .checked_sub(TICKS_EPOCH_OFFSET_SECONDS)
        .ok_or_else(out_of_range)?;
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    let utc = DateTime::<Utc>::from_timestamp(seconds, nanos).ok_or_else(out_of_range)?;
    let offset = FixedOffset::east_opt(i32::from(offset_minutes) * 60).ok_or_else(|| {
        CmdbError::Decode(format!("offset of {} minutes out of range", offset_minutes))
    })?;
    Ok(utc.with_timezone(&offset))
}

fn image_scalar(
    mut reader: ControlReader<'_>,
    binary: &[u8],
    want_full_binary: bool,
) -> Result<AttributeValue, CmdbError> {
    let size = reader.read_len()?;
    let hash = reader.read_bytes(HASH_LENGTH)?;
    let mime_len = reader.read_len()?;
    let mime_type = reader.read_utf8(mime_len)?;
    reader.finish()?;

    let proxy = build_proxy(hash, mime_type, size, want_full_binary.then_some(binary))?;
    Ok(AttributeValue::Image(proxy))
}

fn image_array(
    mut reader: ControlReader<'_>,
    binary: &[u8],
    want_full_binary: bool,
) -> Result<AttributeValue, CmdbError> {
    let count = reader.read_count()?;
    let mut sizes = Vec::with_capacity(count);
    for _ in 0..count {
        sizes.push(reader.read_len()?);
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(reader.read_bytes(HASH_LENGTH)?);
    }
    let mut mime_lens = Vec::with_capacity(count);
    for _ in 0..count {
        mime_lens.push(reader.read_len()?);
    }
    let mut mime_types = Vec::with_capacity(count);
    for len in mime_lens {
        mime_types.push(reader.read_utf8(len)?);
    }
    reader.finish()?;

    if want_full_binary {
        let total = sizes.iter().try_fold(0usize, |acc, s| acc.checked_add(*s));
        if total != Some(binary.len()) {
            return Err(CmdbError::Decode(format!(
                "image payloads have {} bytes, control declares {:?}",
                binary.len(),
                total
            )));
        }
    }

    let mut offset = 0usize;
    let mut proxies = Vec::with_capacity(count);
    for ((hash, mime_type), size) in hashes.into_iter().zip(mime_types).zip(sizes) {
        let data = if want_full_binary {
            let slice = binary
                .get(offset..offset + size)
                .ok_or_else(|| CmdbError::Decode("image payload truncated".to_string()))?;
            offset += size;
            Some(slice)
        } else {
            None
        };
        proxies.push(build_proxy(hash, mime_type, size, data)?);
    }
    Ok(AttributeValue::ImageArray(proxies))
}

fn build_proxy(
    hash: &[u8],
    mime_type: String,
    size: usize,
    data: Option<&[u8]>,
) -> Result<BinaryProxy, CmdbError> {
    let size = u32::try_from(size)
        .map_err(|_| CmdbError::Decode(format!("image size {} out of range", size)))?;
    match data {
        Some(bytes) => BinaryProxy::from_hash_and_data(hash, mime_type, size, bytes.to_vec()),
        None => BinaryProxy::from_hash(hash, mime_type, size),
    }
}

/// Split `text` into consecutive pieces of the given UTF-16 lengths.
fn split_utf16(text: &str, lengths: &[usize]) -> Result<Vec<String>, CmdbError> {
    let mut pieces = Vec::with_capacity(lengths.len());
    let mut chars = text.char_indices();
    let mut start = 0usize;
    for &len in lengths {
        let mut units = 0usize;
        let mut end = start;
        while units < len {
            let (idx, ch) = chars.next().ok_or_else(|| {
                CmdbError::Decode("array element lengths exceed text length".to_string())
            })?;
            units += ch.len_utf16();
            end = idx + ch.len_utf8();
        }
        if units != len {
            return Err(CmdbError::Decode(
                "array element boundary splits a surrogate pair".to_string(),
            ));
        }
        pieces.push(text[start..end].to_string());
        start = end;
    }
    if start != text.len() {
        return Err(CmdbError::Decode(format!(
            "{} trailing bytes after last array element",
            text.len() - start
        )));
    }
    Ok(pieces)
}

// =============================================================================
// CONTROL READER
// =============================================================================

struct ControlReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ControlReader<'a> {
    /// Validate the header; returns whether the value is an array.
    fn open(control: &'a [u8]) -> Result<(bool, Self), CmdbError> {
        let Some(&version) = control.first() else {
            // Values written before control bytes existed.
            return Err(CmdbError::ObsoleteFormat(0x00));
        };
        match version {
            FORMAT_VERSION => {}
            OBSOLETE_FORMAT_VERSION => return Err(CmdbError::ObsoleteFormat(version)),
            other => return Err(CmdbError::UnknownFormatVersion(other)),
        }
        let is_array = match control.get(1) {
            Some(&SCALAR_MARKER) => false,
            Some(&ARRAY_MARKER) => true,
            Some(other) => {
                return Err(CmdbError::Decode(format!(
                    "invalid scalar/array marker {:#04x}",
                    other
                )));
            }
            None => return Err(CmdbError::Decode("control header truncated".to_string())),
        };
        Ok((
            is_array,
            Self {
                bytes: control,
                pos: CONTROL_HEADER_LEN,
            },
        ))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CmdbError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                CmdbError::Decode(format!(
                    "control bytes truncated: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.bytes.len()
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize, CmdbError> {
        let raw = i32::from_le_bytes(le_array::<4>(self.read_bytes(4)?)?);
        usize::try_from(raw).map_err(|_| CmdbError::Decode(format!("negative length {}", raw)))
    }

    fn read_count(&mut self) -> Result<usize, CmdbError> {
        let count = self.read_len()?;
        if count > MAX_ARRAY_ELEMENTS {
            return Err(CmdbError::Decode(format!(
                "array element count {} exceeds maximum {}",
                count, MAX_ARRAY_ELEMENTS
            )));
        }
        Ok(count)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, CmdbError> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CmdbError::Decode(format!("MIME type is not UTF-8: {e}")))
    }

    fn finish(self) -> Result<(), CmdbError> {
        if self.pos != self.bytes.len() {
            return Err(CmdbError::Decode(format!(
                "{} unexpected trailing control bytes",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &AttributeValue) -> AttributeValue {
        let m = marshal(value).expect("marshal");
        m.unmarshal(value.value_type(), true).expect("unmarshal")
    }

    #[test]
    fn scalar_text_layout() {
        let m = marshal(&AttributeValue::text("hello")).expect("marshal");
        assert_eq!(m.text, "hello");
        assert!(m.binary.is_empty());
        assert_eq!(m.control, vec![0x02, 0x01]);
    }

    #[test]
    fn text_array_layout_bit_exact() {
        let m = marshal(&AttributeValue::TextArray(vec!["ab".into(), String::new(), "c".into()]))
            .expect("marshal");
        assert_eq!(m.text, "abc");
        assert_eq!(
            m.control,
            vec![
                0x02, 0x02, // header
                3, 0, 0, 0, // count
                2, 0, 0, 0, // "ab"
                0, 0, 0, 0, // ""
                1, 0, 0, 0, // "c"
            ]
        );
    }

    #[test]
    fn text_array_lengths_count_utf16_units() {
        let value = AttributeValue::TextArray(vec!["😀".into(), "é".into()]);
        let m = marshal(&value).expect("marshal");
        assert_eq!(&m.control[6..10], &2i32.to_le_bytes());
        assert_eq!(&m.control[10..14], &1i32.to_le_bytes());
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn double_and_boolean_layout() {
        let m = marshal(&AttributeValue::Double(1.5)).expect("marshal");
        assert_eq!(m.binary, 1.5f64.to_le_bytes().to_vec());
        assert_eq!(m.control, vec![0x02, 0x01]);

        let m = marshal(&AttributeValue::BooleanArray(vec![true, false])).expect("marshal");
        assert_eq!(m.binary, vec![1, 0]);
        assert_eq!(m.control, vec![0x02, 0x02, 2, 0, 0, 0]);
    }

    #[test]
    fn date_time_layout() {
        let ts = DateTime::parse_from_rfc3339("1970-01-01T01:00:00+01:00").expect("ts");
        let m = marshal(&AttributeValue::date_time(ts)).expect("marshal");
        let ticks = TICKS_EPOCH_OFFSET_SECONDS * TICKS_PER_SECOND;
        assert_eq!(&m.binary[..8], &ticks.to_le_bytes());
        assert_eq!(&m.binary[8..], &60i16.to_le_bytes());
        assert_eq!(roundtrip(&AttributeValue::date_time(ts)), AttributeValue::date_time(ts));
    }

    #[test]
    fn image_scalar_layout() {
        let proxy = BinaryProxy::from_bytes("image/png", vec![7, 8, 9]).expect("proxy");
        let m = marshal(&AttributeValue::Image(proxy.clone())).expect("marshal");
        assert_eq!(m.binary, vec![7, 8, 9]);
        assert_eq!(&m.control[..2], &[0x02, 0x01]);
        assert_eq!(&m.control[2..6], &3i32.to_le_bytes());
        assert_eq!(&m.control[6..38], proxy.hash());
        assert_eq!(&m.control[38..42], &9i32.to_le_bytes());
        assert_eq!(&m.control[42..], b"image/png");
    }

    #[test]
    fn image_array_roundtrip_full_and_proxy() {
        let a = BinaryProxy::from_bytes("image/png", vec![1, 2]).expect("proxy");
        let b = BinaryProxy::from_bytes("image/gif", vec![3]).expect("proxy");
        let value = AttributeValue::ImageArray(vec![a, b]);
        let m = marshal(&value).expect("marshal");

        let full = m.unmarshal(AttributeValueType::Image, true).expect("full");
        let AttributeValue::ImageArray(ref proxies) = full else {
            unreachable!("decoded as image array");
        };
        assert!(proxies.iter().all(BinaryProxy::has_full_data));
        assert_eq!(proxies[1].data(), Some(&[3u8][..]));
        assert_eq!(full, value);

        let meta = unmarshal("", &[], &m.control, AttributeValueType::Image, false).expect("meta");
        let AttributeValue::ImageArray(ref proxies) = meta else {
            unreachable!("decoded as image array");
        };
        assert!(proxies.iter().all(|p| !p.has_full_data()));
        assert_eq!(meta, value);
    }

    #[test]
    fn marshal_image_without_payload_fails() {
        let full = BinaryProxy::from_bytes("image/png", vec![1]).expect("proxy");
        let meta = full.without_data();
        let result = marshal(&AttributeValue::Image(meta));
        assert!(matches!(result, Err(CmdbError::Encode(_))));
    }

    #[test]
    fn image_truncated_hash_fails() {
        let mut control = vec![0x02, 0x01];
        control.extend_from_slice(&0i32.to_le_bytes());
        control.extend_from_slice(&[0u8; 20]);
        let result = unmarshal("", &[], &control, AttributeValueType::Image, false);
        assert!(matches!(result, Err(CmdbError::Decode(_))));
    }

    #[test]
    fn mask_roundtrip() {
        let m = marshal(&AttributeValue::Mask).expect("marshal");
        assert_eq!(m, MarshalledValue { text: String::new(), binary: Vec::new(), control: vec![2, 1] });
        assert_eq!(roundtrip(&AttributeValue::Mask), AttributeValue::Mask);
    }

    #[test]
    fn obsolete_and_unknown_versions() {
        let result = unmarshal("x", &[], &[0x01, 0x01], AttributeValueType::Text, false);
        assert!(matches!(result, Err(CmdbError::ObsoleteFormat(0x01))));

        let result = unmarshal("x", &[], &[], AttributeValueType::Text, false);
        assert!(matches!(result, Err(CmdbError::ObsoleteFormat(_))));

        let result = unmarshal("x", &[], &[0x03, 0x01], AttributeValueType::Text, false);
        assert!(matches!(result, Err(CmdbError::UnknownFormatVersion(0x03))));
    }

    #[test]
    fn malformed_control_rejected() {
        let truncated = [0x02, 0x02, 2, 0, 0, 0, 1, 0, 0, 0];
        assert!(unmarshal("ab", &[], &truncated, AttributeValueType::Text, false).is_err());

        let trailing = [0x02, 0x01, 0xFF];
        assert!(unmarshal("ab", &[], &trailing, AttributeValueType::Text, false).is_err());

        let bad_marker = [0x02, 0x07];
        assert!(unmarshal("ab", &[], &bad_marker, AttributeValueType::Text, false).is_err());

        let lengths_too_long = [0x02, 0x02, 1, 0, 0, 0, 5, 0, 0, 0];
        assert!(unmarshal("ab", &[], &lengths_too_long, AttributeValueType::Text, false).is_err());
    }

    #[test]
    fn fixed_width_size_mismatch_rejected() {
        let result = unmarshal("", &[0u8; 7], &[0x02, 0x01], AttributeValueType::Double, false);
        assert!(matches!(result, Err(CmdbError::Decode(_))));
    }

    #[test]
    fn malformed_json_degrades_but_integer_fails() {
        let json = unmarshal("{oops", &[], &[0x02, 0x01], AttributeValueType::Json, false)
            .expect("json degrades");
        let AttributeValue::Json(inner) = json else {
            unreachable!("decoded as json");
        };
        assert!(inner.get("error").is_some());

        let integer = unmarshal("12a", &[], &[0x02, 0x01], AttributeValueType::Integer, false);
        assert!(matches!(integer, Err(CmdbError::Decode(_))));
    }

    #[test]
    fn every_variant_roundtrips() {
        let ts = DateTime::parse_from_rfc3339("2023-06-01T12:30:00.5-04:30").expect("ts");
        let values = vec![
            AttributeValue::text("a,b\\c"),
            AttributeValue::multiline_text("line1\nline2"),
            AttributeValue::Integer(i64::MIN),
            AttributeValue::Double(-2.25),
            AttributeValue::Boolean(false),
            AttributeValue::date_time(ts),
            AttributeValue::Json(serde_json::json!({"k": [1, 2, {"n": null}]})),
            AttributeValue::yaml_lenient("a: 1\nb: [x, y]\n"),
            AttributeValue::MultilineTextArray(vec!["x\ny".into(), String::new()]),
            AttributeValue::IntegerArray(vec![1, -1, 0]),
            AttributeValue::DoubleArray(vec![0.1, f64::MAX]),
            AttributeValue::DateTimeWithOffsetArray(vec![ts, ts]),
            AttributeValue::JsonArray(vec![serde_json::json!(1), serde_json::json!("s")]),
            AttributeValue::YamlArray(vec![YamlDocument::parse_lenient("- 1\n")]),
            AttributeValue::TextArray(Vec::new()),
        ];
        for value in values {
            assert_eq!(roundtrip(&value), value, "roundtrip of {:?}", value);
        }
    }
}
