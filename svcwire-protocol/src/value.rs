//! Rich values carried in request parameters, response bodies and events.
//!
//! On the wire a value is plain JSON, except for the kinds JSON cannot
//! represent losslessly. Those are written inline as
//! `{"__type__": TAG, "data": ...}`:
//!
//! | kind        | tag          | data                                   |
//! |-------------|--------------|----------------------------------------|
//! | date-time   | `Date`       | RFC 3339 string, UTC                   |
//! | date only   | `DateOnly`   | `YYYY-MM-DD`                           |
//! | time only   | `Time`       | `HH:MM:SS[.fraction]`                  |
//! | UUID        | `Uuid`       | hyphenated string                      |
//! | binary      | `Uint8Array` | lower-case hex                         |
//! | error       | `Error`      | object with `name`, `message`, `stack` |
//!
//! Decoding any other tag fails with [`ProtocolError::UnsupportedType`].

use crate::error::ProtocolError;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Discriminator key of a tagged value.
pub const TYPE_KEY: &str = "__type__";

/// Payload key of a tagged value.
pub const DATA_KEY: &str = "data";

/// Placeholder written instead of binary data in [`EncodeMode::HideBinary`].
pub const HIDDEN_BINARY: &str = "__hidden__";

const TAG_DATE_TIME: &str = "Date";
const TAG_DATE: &str = "DateOnly";
const TAG_TIME: &str = "Time";
const TAG_UUID: &str = "Uuid";
const TAG_BYTES: &str = "Uint8Array";
const TAG_ERROR: &str = "Error";

const KNOWN_TAGS: [&str; 6] = [
    TAG_DATE_TIME,
    TAG_DATE,
    TAG_TIME,
    TAG_UUID,
    TAG_BYTES,
    TAG_ERROR,
];

/// How binary blobs are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeMode {
    /// Lossless, used for everything that goes on the wire.
    #[default]
    Wire,
    /// Binary blobs replaced with a placeholder. Only for logs.
    HideBinary,
}

/// A protocol value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
    Bytes(Bytes),
    Error(WireError),
}

/// An error object carried as a value.
///
/// Extra fields (`code`, `detail`, `cause`, ...) survive the round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Value {
    /// Builds an object from key/value pairs.
    pub fn object<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Converts any serializable type into a value.
    ///
    /// Tagged objects produced by the serializer are interpreted, so a type
    /// that serializes to `{"__type__": "Uuid", ...}` becomes [`Value::Uuid`].
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        Value::from_json(serde_json::to_value(value)?)
    }

    /// Converts this value into any deserializable type.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.to_json(EncodeMode::Wire))?)
    }

    /// Interprets a JSON tree, reconstructing tagged values.
    pub fn from_json(json: Json) -> Result<Self, ProtocolError> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(mut map) => match map.remove(TYPE_KEY) {
                None => Value::Object(
                    map.into_iter()
                        .map(|(k, v)| Ok((k, Value::from_json(v)?)))
                        .collect::<Result<_, ProtocolError>>()?,
                ),
                Some(Json::String(tag)) => {
                    let data = map.remove(DATA_KEY).unwrap_or(Json::Null);
                    decode_tagged(&tag, data)?
                }
                Some(other) => {
                    return Err(ProtocolError::invalid_value(
                        TYPE_KEY,
                        format!("expected a string tag, got {other}"),
                    ))
                }
            },
        })
    }

    /// Renders this value as a JSON tree.
    pub fn to_json(&self, mode: EncodeMode) -> Json {
        // Serializing into serde_json::Value cannot fail for this type:
        // map keys are always strings.
        serde_json::to_value(Encoded { value: self, mode }).unwrap_or(Json::Null)
    }

    /// Wraps this value for serialization in the given mode.
    pub fn encoded(&self, mode: EncodeMode) -> impl Serialize + '_ {
        Encoded { value: self, mode }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Looks up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Short name of this value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::DateTime(_) => TAG_DATE_TIME,
            Value::Date(_) => TAG_DATE,
            Value::Time(_) => TAG_TIME,
            Value::Uuid(_) => TAG_UUID,
            Value::Bytes(_) => TAG_BYTES,
            Value::Error(_) => TAG_ERROR,
        }
    }
}

/// Finds the first `__type__` tag in a JSON tree that cannot be decoded.
pub fn find_unsupported_tag(json: &Json) -> Option<&str> {
    match json {
        Json::Array(items) => items.iter().find_map(find_unsupported_tag),
        Json::Object(map) => match map.get(TYPE_KEY) {
            Some(Json::String(tag)) if !KNOWN_TAGS.contains(&tag.as_str()) => Some(tag),
            _ => map.values().find_map(find_unsupported_tag),
        },
        _ => None,
    }
}

fn decode_tagged(tag: &str, data: Json) -> Result<Value, ProtocolError> {
    match tag {
        TAG_DATE_TIME => {
            let s = expect_str(tag, &data)?;
            DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::DateTime(dt.with_timezone(&Utc)))
                .map_err(|e| ProtocolError::invalid_value(tag, e))
        }
        TAG_DATE => expect_str(tag, &data)?
            .parse::<NaiveDate>()
            .map(Value::Date)
            .map_err(|e| ProtocolError::invalid_value(tag, e)),
        TAG_TIME => expect_str(tag, &data)?
            .parse::<NaiveTime>()
            .map(Value::Time)
            .map_err(|e| ProtocolError::invalid_value(tag, e)),
        TAG_UUID => Uuid::parse_str(expect_str(tag, &data)?)
            .map(Value::Uuid)
            .map_err(|e| ProtocolError::invalid_value(tag, e)),
        TAG_BYTES => {
            let s = expect_str(tag, &data)?;
            if s == HIDDEN_BINARY {
                return Err(ProtocolError::invalid_value(
                    tag,
                    "binary data was redacted and cannot be decoded",
                ));
            }
            hex::decode(s)
                .map(|b| Value::Bytes(Bytes::from(b)))
                .map_err(|e| ProtocolError::invalid_value(tag, e))
        }
        TAG_ERROR => decode_error(data).map(Value::Error),
        other => Err(ProtocolError::UnsupportedType(other.to_string())),
    }
}

fn expect_str<'a>(tag: &str, data: &'a Json) -> Result<&'a str, ProtocolError> {
    data.as_str()
        .ok_or_else(|| ProtocolError::invalid_value(tag, "expected a string"))
}

fn decode_error(data: Json) -> Result<WireError, ProtocolError> {
    let Json::Object(mut map) = data else {
        return Err(ProtocolError::invalid_value(TAG_ERROR, "expected an object"));
    };

    let name = match map.remove("name") {
        Some(Json::String(s)) => s,
        _ => "Error".to_string(),
    };
    let message = match map.remove("message") {
        Some(Json::String(s)) => s,
        _ => String::new(),
    };
    let stack = match map.remove("stack") {
        Some(Json::String(s)) => Some(s),
        _ => None,
    };
    let extra = map
        .into_iter()
        .map(|(k, v)| Ok((k, Value::from_json(v)?)))
        .collect::<Result<_, ProtocolError>>()?;

    Ok(WireError {
        name,
        message,
        stack,
        extra,
    })
}

struct Encoded<'a> {
    value: &'a Value,
    mode: EncodeMode,
}

impl Serialize for Encoded<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mode = self.mode;
        match self.value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for value in items {
                    seq.serialize_element(&Encoded { value, mode })?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, &Encoded { value, mode })?;
                }
                out.end()
            }
            Value::DateTime(dt) => tagged(
                serializer,
                TAG_DATE_TIME,
                &dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            Value::Date(d) => tagged(serializer, TAG_DATE, &d.to_string()),
            Value::Time(t) => tagged(serializer, TAG_TIME, &t.to_string()),
            Value::Uuid(u) => tagged(serializer, TAG_UUID, &u.hyphenated().to_string()),
            Value::Bytes(b) => match mode {
                EncodeMode::Wire => tagged(serializer, TAG_BYTES, &hex::encode(b)),
                EncodeMode::HideBinary => tagged(serializer, TAG_BYTES, HIDDEN_BINARY),
            },
            Value::Error(err) => tagged(serializer, TAG_ERROR, &EncodedError { err, mode }),
        }
    }
}

struct EncodedError<'a> {
    err: &'a WireError,
    mode: EncodeMode,
}

impl Serialize for EncodedError<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let err = self.err;
        let mut out = serializer.serialize_map(None)?;
        out.serialize_entry("name", &err.name)?;
        out.serialize_entry("message", &err.message)?;
        if let Some(stack) = &err.stack {
            out.serialize_entry("stack", stack)?;
        }
        for (key, value) in &err.extra {
            out.serialize_entry(
                key,
                &Encoded {
                    value,
                    mode: self.mode,
                },
            )?;
        }
        out.end()
    }
}

fn tagged<S: Serializer, T: Serialize + ?Sized>(
    serializer: S,
    tag: &str,
    data: &T,
) -> Result<S::Ok, S::Error> {
    let mut out = serializer.serialize_map(Some(2))?;
    out.serialize_entry(TYPE_KEY, tag)?;
    out.serialize_entry(DATA_KEY, data)?;
    out.end()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Encoded {
            value: self,
            mode: EncodeMode::Wire,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Value::from_json(json).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json(EncodeMode::HideBinary))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v.into())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Number((v as u64).into())
    }
}

impl From<f64> for Value {
    /// Non-finite numbers become `Null`, as in JSON.
    fn from(v: f64) -> Self {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<WireError> for Value {
    fn from(v: WireError) -> Self {
        Value::Error(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Object(v)
    }
}
