// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Codec
//!
//! Messages travel as JSON. Anything implementing `Serialize` can be encoded
//! with [`dumps_message`]; dynamically shaped payloads use [`Payload`], which
//! extends the JSON model with the value kinds that plain JSON has no
//! representation for:
//!
//! - UUIDs are written in their canonical hyphenated form
//! - dates, times and datetimes are written as ISO-8601 strings
//! - decimals are written as floating point numbers (lossy; send a string if
//!   exact precision matters)
//! - sets are written as arrays, in no particular order
//! - bytes are written as UTF-8 text when valid, standard base64 otherwise
//!
//! Decoding is plain JSON. No type information is recovered: an encoded UUID
//! or datetime comes back as a string.

use crate::errors::AmqpError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{
    de::DeserializeOwned,
    ser::{Error as _, SerializeMap, SerializeSeq},
    Serialize, Serializer,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Media type set on every message produced by this crate.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serializes a value into the wire encoding.
pub fn dumps_message<T>(value: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value).map_err(|err| AmqpError::EncodingError(err.to_string()))
}

/// Parses a wire payload.
pub fn loads_message<T>(data: &[u8]) -> Result<T, AmqpError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(data).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}

/// A structured value with the extended kinds the wire codec understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeTz(DateTime<FixedOffset>),
    Decimal(Decimal),
    Set(Vec<Payload>),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Builds an object from key/value pairs.
    pub fn object<K, V, I>(entries: I) -> Payload
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Payload>,
    {
        Payload::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Raw bytes, encoded as a base64 string.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Payload {
        Payload::Bytes(data.into())
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Payload::Null => serializer.serialize_unit(),
            Payload::Bool(v) => serializer.serialize_bool(*v),
            Payload::Int(v) => serializer.serialize_i64(*v),
            Payload::UInt(v) => serializer.serialize_u64(*v),
            Payload::Float(v) => {
                if !v.is_finite() {
                    return Err(S::Error::custom(format!("{} is not representable", v)));
                }
                serializer.serialize_f64(*v)
            }
            Payload::String(v) => serializer.serialize_str(v),
            Payload::Array(items) | Payload::Set(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Payload::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Payload::Uuid(v) => serializer.collect_str(&v.hyphenated()),
            Payload::Date(v) => v.serialize(serializer),
            Payload::Time(v) => v.serialize(serializer),
            Payload::DateTime(v) => v.serialize(serializer),
            Payload::DateTimeTz(v) => v.serialize(serializer),
            Payload::Decimal(v) => match v.to_f64() {
                Some(f) => serializer.serialize_f64(f),
                None => Err(S::Error::custom(format!("decimal {} has no float form", v))),
            },
            Payload::Bytes(v) => match std::str::from_utf8(v) {
                Ok(text) => serializer.serialize_str(text),
                Err(_) => serializer.serialize_str(&STANDARD.encode(v)),
            },
        }
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Bool(v)
    }
}

impl From<i32> for Payload {
    fn from(v: i32) -> Self {
        Payload::Int(v.into())
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Int(v)
    }
}

impl From<u32> for Payload {
    fn from(v: u32) -> Self {
        Payload::UInt(v.into())
    }
}

impl From<u64> for Payload {
    fn from(v: u64) -> Self {
        Payload::UInt(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::String(v.to_owned())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::String(v)
    }
}

impl From<Uuid> for Payload {
    fn from(v: Uuid) -> Self {
        Payload::Uuid(v)
    }
}

impl From<NaiveDate> for Payload {
    fn from(v: NaiveDate) -> Self {
        Payload::Date(v)
    }
}

impl From<NaiveTime> for Payload {
    fn from(v: NaiveTime) -> Self {
        Payload::Time(v)
    }
}

impl From<NaiveDateTime> for Payload {
    fn from(v: NaiveDateTime) -> Self {
        Payload::DateTime(v)
    }
}

impl From<DateTime<FixedOffset>> for Payload {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Payload::DateTimeTz(v)
    }
}

impl From<DateTime<Utc>> for Payload {
    fn from(v: DateTime<Utc>) -> Self {
        Payload::DateTimeTz(v.fixed_offset())
    }
}

impl From<Decimal> for Payload {
    fn from(v: Decimal) -> Self {
        Payload::Decimal(v)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(v: Option<T>) -> Self {
        v.map_or(Payload::Null, Into::into)
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(v: Vec<T>) -> Self {
        Payload::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Payload>> From<HashSet<T>> for Payload {
    fn from(v: HashSet<T>) -> Self {
        Payload::Set(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Payload>> From<BTreeSet<T>> for Payload {
    fn from(v: BTreeSet<T>) -> Self {
        Payload::Set(v.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Payload>> From<HashMap<K, V>> for Payload {
    fn from(v: HashMap<K, V>) -> Self {
        Payload::object(v)
    }
}

impl<K: Into<String>, V: Into<Payload>> From<BTreeMap<K, V>> for Payload {
    fn from(v: BTreeMap<K, V>) -> Self {
        Payload::object(v)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;

        match v {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Payload::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Payload::UInt(u)
                } else {
                    Payload::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::object(map),
        }
    }
}
