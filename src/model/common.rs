use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type Id = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[serde(rename = "StringList")]
    StringList,
    /// RFC 3339 timestamp carried as a JSON string
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl TypedValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::String(value.into()),
            data_type: DataType::String,
        }
    }

    pub fn number(value: i64) -> Self {
        Self {
            value: serde_json::Value::Number(serde_json::Number::from(value)),
            data_type: DataType::Number,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            value: serde_json::Value::Bool(value),
            data_type: DataType::Boolean,
        }
    }

    pub fn date(value: DateTime<Utc>) -> Self {
        Self {
            value: serde_json::Value::String(value.to_rfc3339()),
            data_type: DataType::Date,
        }
    }

    /// Infer a typed value from raw JSON, as connectors deliver untyped payloads
    pub fn infer(value: serde_json::Value) -> Self {
        let data_type = match &value {
            serde_json::Value::String(_) => DataType::String,
            serde_json::Value::Number(_) => DataType::Number,
            serde_json::Value::Bool(_) => DataType::Boolean,
            serde_json::Value::Array(items) if items.iter().all(|v| v.is_string()) => {
                DataType::StringList
            }
            serde_json::Value::Array(_) => DataType::Array,
            _ => DataType::Object,
        };
        Self { value, data_type }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// Ordered property bag; iteration order is stable so fingerprints and
/// serialized forms are reproducible
pub type PropertyBag = BTreeMap<String, TypedValue>;

/// SHA-256 over the canonical JSON form of a property bag
pub fn fingerprint(properties: &PropertyBag) -> String {
    let canonical = serde_json::to_vec(properties).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}
