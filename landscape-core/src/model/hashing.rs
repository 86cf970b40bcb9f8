// landscape-core/src/model/hashing.rs
// ============================================================================
// Module: Canonicalizer
// Description: RFC 8785 JSON canonicalization and SHA-256 content hashing.
// Purpose: Provide the single deterministic `stable_hash` used everywhere an
//          audit record needs a content-addressed identity.
// Dependencies: base64, serde, serde_json, serde_jcs, sha2, time
// ============================================================================

//! ## Overview
//! Every content hash recorded in the Landscape (`source_data_hash`,
//! `input_hash`, `output_hash`, `content_hash`, …) is `stable_hash` of some
//! value's canonical JSON form. Canonicalization follows RFC 8785 (JCS):
//! sorted object keys, shortest numeric representation, no insignificant
//! whitespace. Non-finite numbers are rejected rather than silently coerced
//! to `null` the way a plain `serde_json::to_value` call would, so values
//! are serialized through a dedicated [`serde::Serializer`] that validates
//! as it walks the value instead of inspecting the result afterwards.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::ser::SerializeMap as _;
use serde::ser::SerializeSeq as _;
use serde::ser::SerializeStruct as _;
use serde::ser::SerializeStructVariant as _;
use serde::ser::SerializeTuple as _;
use serde::ser::SerializeTupleStruct as _;
use serde::ser::SerializeTupleVariant as _;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

/// Version tag written into every `Run.canonical_version` field, so a stored
/// run can be matched back to the canonicalization rules that produced it.
pub const CANONICAL_VERSION: &str = "landscape-jcs-1";

/// Errors raised while canonicalizing a value.
#[derive(Debug, Error)]
pub enum CanonicalizationError {
    /// The value contained `NaN`, `+Infinity`, or `-Infinity`.
    #[error("cannot canonicalize a non-finite number")]
    NonFiniteNumber,
    /// A mapping had a non-string key.
    #[error("map keys must be strings")]
    NonStringKey,
    /// The value could not be represented as JSON at all.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    /// RFC 8785 serialization failed after the value was validated.
    #[error("jcs serialization failed: {0}")]
    Jcs(String),
}

impl serde::ser::Error for CanonicalizationError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::UnsupportedType(msg.to_string())
    }
}

/// Wraps raw bytes so they canonicalize as `{"__bytes__": "<base64>"}`
/// instead of a JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBytes(pub Vec<u8>);

impl Serialize for RawBytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("__bytes__", &STANDARD.encode(&self.0))?;
        map.end()
    }
}

/// Wraps a timestamp so it canonicalizes as UTC ISO-8601 with an explicit
/// `+00:00` offset, regardless of the offset it was constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalTimestamp(pub OffsetDateTime);

impl Serialize for CanonicalTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format_utc_offset(self.0))
    }
}

/// Formats a timestamp as UTC with an explicit numeric `+00:00` offset.
fn format_utc_offset(ts: OffsetDateTime) -> String {
    const FORMAT: &[time::format_description::FormatItem<'_>] = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
    );
    let utc = ts.to_offset(time::UtcOffset::UTC);
    // Formatting a fixed, well-formed description cannot fail for a valid
    // `OffsetDateTime`; fall back to the RFC 3339 form rather than panic.
    utc.format(&FORMAT).unwrap_or_else(|_| utc.to_string())
}

// ============================================================================
// SECTION: Validating value serializer
// ============================================================================

/// A [`serde::Serializer`] that builds a `serde_json::Value` while rejecting
/// non-finite floats and non-string map keys at the point they occur, rather
/// than inspecting an already-built value (by which point `serde_json` would
/// already have silently turned `NaN`/`Infinity` into `null`).
struct ValueSerializer;

type VResult = Result<Value, CanonicalizationError>;

impl serde::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = CanonicalizationError;
    type SerializeSeq = SeqCollector;
    type SerializeTuple = SeqCollector;
    type SerializeTupleStruct = SeqCollector;
    type SerializeTupleVariant = VariantSeqCollector;
    type SerializeMap = MapCollector;
    type SerializeStruct = MapCollector;
    type SerializeStructVariant = VariantMapCollector;

    fn serialize_bool(self, v: bool) -> VResult {
        Ok(Value::Bool(v))
    }
    fn serialize_i8(self, v: i8) -> VResult {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i16(self, v: i16) -> VResult {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i32(self, v: i32) -> VResult {
        self.serialize_i64(i64::from(v))
    }
    fn serialize_i64(self, v: i64) -> VResult {
        Ok(Value::from(v))
    }
    fn serialize_i128(self, v: i128) -> VResult {
        i64::try_from(v)
            .map(Value::from)
            .map_err(|err| CanonicalizationError::UnsupportedType(err.to_string()))
    }
    fn serialize_u8(self, v: u8) -> VResult {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u16(self, v: u16) -> VResult {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u32(self, v: u32) -> VResult {
        self.serialize_u64(u64::from(v))
    }
    fn serialize_u64(self, v: u64) -> VResult {
        Ok(Value::from(v))
    }
    fn serialize_u128(self, v: u128) -> VResult {
        u64::try_from(v)
            .map(Value::from)
            .map_err(|err| CanonicalizationError::UnsupportedType(err.to_string()))
    }
    fn serialize_f32(self, v: f32) -> VResult {
        self.serialize_f64(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> VResult {
        if !v.is_finite() {
            return Err(CanonicalizationError::NonFiniteNumber);
        }
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .ok_or(CanonicalizationError::NonFiniteNumber)
    }
    fn serialize_char(self, v: char) -> VResult {
        Ok(Value::String(v.to_string()))
    }
    fn serialize_str(self, v: &str) -> VResult {
        Ok(Value::String(v.to_owned()))
    }
    fn serialize_bytes(self, v: &[u8]) -> VResult {
        RawBytes(v.to_vec()).serialize(self)
    }
    fn serialize_none(self) -> VResult {
        Ok(Value::Null)
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> VResult {
        value.serialize(self)
    }
    fn serialize_unit(self) -> VResult {
        Ok(Value::Null)
    }
    fn serialize_unit_struct(self, _name: &'static str) -> VResult {
        Ok(Value::Null)
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> VResult {
        Ok(Value::String(variant.to_owned()))
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> VResult {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> VResult {
        let inner = value.serialize(ValueSerializer)?;
        let mut map = serde_json::Map::new();
        map.insert(variant.to_owned(), inner);
        Ok(Value::Object(map))
    }
    fn serialize_seq(self, len: Option<usize>) -> Result<SeqCollector, CanonicalizationError> {
        Ok(SeqCollector(Vec::with_capacity(len.unwrap_or(0))))
    }
    fn serialize_tuple(self, len: usize) -> Result<SeqCollector, CanonicalizationError> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqCollector, CanonicalizationError> {
        self.serialize_seq(Some(len))
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqCollector, CanonicalizationError> {
        Ok(VariantSeqCollector {
            variant,
            items: Vec::with_capacity(len),
        })
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<MapCollector, CanonicalizationError> {
        Ok(MapCollector {
            map: serde_json::Map::new(),
            pending_key: None,
        })
    }
    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<MapCollector, CanonicalizationError> {
        Ok(MapCollector {
            map: serde_json::Map::new(),
            pending_key: None,
        })
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapCollector, CanonicalizationError> {
        Ok(VariantMapCollector {
            variant,
            map: serde_json::Map::new(),
        })
    }
}

/// Accumulates sequence elements for `Vec`/array-like serialization.
struct SeqCollector(Vec<Value>);

impl serde::ser::SerializeSeq for SeqCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.0.push(value.serialize(ValueSerializer)?);
        Ok(())
    }
    fn end(self) -> VResult {
        Ok(Value::Array(self.0))
    }
}

impl serde::ser::SerializeTuple for SeqCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        serde::ser::SerializeSeq::serialize_element(self, value)
    }
    fn end(self) -> VResult {
        serde::ser::SerializeSeq::end(self)
    }
}

impl serde::ser::SerializeTupleStruct for SeqCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        serde::ser::SerializeSeq::serialize_element(self, value)
    }
    fn end(self) -> VResult {
        serde::ser::SerializeSeq::end(self)
    }
}

/// Accumulates a tuple-variant's elements, wrapped under the variant name.
struct VariantSeqCollector {
    variant: &'static str,
    items: Vec<Value>,
}

impl serde::ser::SerializeTupleVariant for VariantSeqCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }
    fn end(self) -> VResult {
        let mut map = serde_json::Map::new();
        map.insert(self.variant.to_owned(), Value::Array(self.items));
        Ok(Value::Object(map))
    }
}

/// Accumulates map/struct entries, validating that every key serializes to
/// a JSON string before it is accepted.
struct MapCollector {
    map: serde_json::Map<String, Value>,
    pending_key: Option<String>,
}

impl serde::ser::SerializeMap for MapCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Self::Error> {
        let key_value = key.serialize(ValueSerializer)?;
        let Value::String(key_str) = key_value else {
            return Err(CanonicalizationError::NonStringKey);
        };
        self.pending_key = Some(key_str);
        Ok(())
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| CanonicalizationError::UnsupportedType("missing map key".into()))?;
        self.map.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }
    fn end(self) -> VResult {
        Ok(Value::Object(self.map))
    }
}

impl serde::ser::SerializeStruct for MapCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.map
            .insert(key.to_owned(), value.serialize(ValueSerializer)?);
        Ok(())
    }
    fn end(self) -> VResult {
        Ok(Value::Object(self.map))
    }
}

/// Accumulates a struct-variant's fields, wrapped under the variant name.
struct VariantMapCollector {
    variant: &'static str,
    map: serde_json::Map<String, Value>,
}

impl serde::ser::SerializeStructVariant for VariantMapCollector {
    type Ok = Value;
    type Error = CanonicalizationError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        self.map
            .insert(key.to_owned(), value.serialize(ValueSerializer)?);
        Ok(())
    }
    fn end(self) -> VResult {
        let mut outer = serde_json::Map::new();
        outer.insert(self.variant.to_owned(), Value::Object(self.map));
        Ok(Value::Object(outer))
    }
}

// ============================================================================
// SECTION: Public API
// ============================================================================

/// Converts a serializable value into a validated `serde_json::Value`,
/// rejecting non-finite numbers and non-string map keys as it walks the
/// value rather than after the fact.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] when the value cannot be canonicalized.
pub fn canonicalize_to_value<T: Serialize + ?Sized>(value: &T) -> VResult {
    value.serialize(ValueSerializer)
}

/// Returns canonical JSON bytes for a serializable value, per RFC 8785.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] when the value cannot be canonicalized.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(
    value: &T,
) -> Result<Vec<u8>, CanonicalizationError> {
    let json = canonicalize_to_value(value)?;
    serde_jcs::to_vec(&json).map_err(|err| CanonicalizationError::Jcs(err.to_string()))
}

/// Hashes raw bytes with SHA-256, returning lowercase hex.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Computes `sha256(canonicalize(value))` as lowercase hex.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] when the value cannot be canonicalized.
pub fn hash_canonical_json<T: Serialize + ?Sized>(
    value: &T,
) -> Result<String, CanonicalizationError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Convenience alias for [`hash_canonical_json`]; the name used throughout
/// the rest of the crate and the spec this implements.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] when the value cannot be canonicalized.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalizationError> {
    hash_canonical_json(value)
}

/// Encodes bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        reason = "test assertions only"
    )]

    use super::*;
    use serde_json::json;

    #[test]
    fn golden_canonical_hash() {
        let value = json!({"b": 2, "a": 1, "list": [3, 1, 2]});
        let bytes = canonical_json_bytes(&value).expect("canonicalize");
        assert_eq!(bytes, br#"{"a":1,"b":2,"list":[3,1,2]}"#);
        let hash = stable_hash(&value).expect("hash");
        assert_eq!(hash, hash_bytes(br#"{"a":1,"b":2,"list":[3,1,2]}"#));
    }

    #[test]
    fn key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(stable_hash(&a).unwrap(), stable_hash(&b).unwrap());
    }

    #[test]
    fn rejects_non_finite_float_directly() {
        assert!(matches!(
            canonicalize_to_value(&f64::NAN),
            Err(CanonicalizationError::NonFiniteNumber)
        ));
        assert!(matches!(
            canonicalize_to_value(&f64::INFINITY),
            Err(CanonicalizationError::NonFiniteNumber)
        ));
    }

    #[test]
    fn rejects_non_finite_nested_in_struct() {
        #[derive(Serialize)]
        struct Wrapper {
            score: f64,
        }
        let value = Wrapper {
            score: f64::NEG_INFINITY,
        };
        assert!(matches!(
            canonicalize_to_value(&value),
            Err(CanonicalizationError::NonFiniteNumber)
        ));
    }

    #[test]
    fn raw_bytes_wrap_as_base64_object() {
        let wrapped = RawBytes(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let value = canonicalize_to_value(&wrapped).expect("canonicalize");
        assert_eq!(value["__bytes__"], json!("3q2+7w=="));
    }

    #[test]
    fn timestamp_uses_explicit_utc_offset() {
        let ts = OffsetDateTime::from_unix_timestamp(0).expect("epoch");
        let wrapped = CanonicalTimestamp(ts);
        let value = canonicalize_to_value(&wrapped).expect("canonicalize");
        assert_eq!(value, json!("1970-01-01T00:00:00+00:00"));
    }

    #[test]
    fn idempotent_on_already_canonical_value() {
        let value = json!({"a": [1, 2, 3], "b": "x"});
        let once = canonical_json_bytes(&value).unwrap();
        let parsed: Value = serde_json::from_slice(&once).unwrap();
        let twice = canonical_json_bytes(&parsed).unwrap();
        assert_eq!(once, twice);
    }
}
