//! Closed value type for event parameters and expression variable contexts.
//!
//! Wire form is adjacently tagged: `{"type": "int", "value": 3}`. Bytes travel
//! as standard base64 strings.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PassableValue {
    List(Vec<PassableValue>),
    Map(HashMap<String, PassableValue>),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    #[serde(alias = "Null")]
    Null,
}

impl PassableValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PassableValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PassableValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used for comparisons. Timestamps compare as their millisecond value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PassableValue::Int(i) | PassableValue::Timestamp(i) => Some(*i as f64),
            PassableValue::Uint(u) => Some(*u as f64),
            PassableValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PassableValue::Null)
    }

    /// Walks a dotted path (`user.profile.level`) through nested maps.
    pub fn get_path(&self, path: &str) -> Option<&PassableValue> {
        path.split('.').try_fold(self, |current, segment| match current {
            PassableValue::Map(map) => map.get(segment),
            _ => None,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PassableValue::List(items) => {
                serde_json::Value::Array(items.iter().map(PassableValue::to_json).collect())
            }
            PassableValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            PassableValue::Int(i) | PassableValue::Timestamp(i) => serde_json::Value::from(*i),
            PassableValue::Uint(u) => serde_json::Value::from(*u),
            PassableValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PassableValue::String(s) => serde_json::Value::String(s.clone()),
            PassableValue::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            PassableValue::Bool(b) => serde_json::Value::Bool(*b),
            PassableValue::Null => serde_json::Value::Null,
        }
    }
}

impl From<serde_json::Value> for PassableValue {
    /// Integers that fit `i64` become `Int`, larger ones `Uint`, everything else `Float`.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PassableValue::Null,
            serde_json::Value::Bool(b) => PassableValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PassableValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    PassableValue::Uint(u)
                } else {
                    PassableValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => PassableValue::String(s),
            serde_json::Value::Array(items) => {
                PassableValue::List(items.into_iter().map(PassableValue::from).collect())
            }
            serde_json::Value::Object(map) => PassableValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, PassableValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for PassableValue {
    fn from(value: &str) -> Self {
        PassableValue::String(value.to_string())
    }
}

impl From<String> for PassableValue {
    fn from(value: String) -> Self {
        PassableValue::String(value)
    }
}

impl From<i64> for PassableValue {
    fn from(value: i64) -> Self {
        PassableValue::Int(value)
    }
}

impl From<u64> for PassableValue {
    fn from(value: u64) -> Self {
        PassableValue::Uint(value)
    }
}

impl From<f64> for PassableValue {
    fn from(value: f64) -> Self {
        PassableValue::Float(value)
    }
}

impl From<bool> for PassableValue {
    fn from(value: bool) -> Self {
        PassableValue::Bool(value)
    }
}

impl From<HashMap<String, PassableValue>> for PassableValue {
    fn from(value: HashMap<String, PassableValue>) -> Self {
        PassableValue::Map(value)
    }
}

impl<T: Into<PassableValue>> From<Option<T>> for PassableValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PassableValue::Null)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
