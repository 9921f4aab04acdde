//! Parameter contracts
//!
//! A [`Schema`] is an ordered mapping from key to [`SocketSpec`]. Document order
//! is the canonical order used when building prompt text, so the schema keeps
//! its entries in a `Vec` and (de)serializes them as a map by hand.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Validated parameter values keyed by schema key
pub type Params = BTreeMap<String, Value>;

/// The value type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    Float,
    Integer,
    Bool,
    /// Any type name this crate does not know; values pass through unchanged.
    #[serde(other)]
    Unknown,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Float | Self::Integer)
    }
}

/// One parameter contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketSpec {
    #[serde(rename = "type")]
    pub ty: SocketType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default)]
    pub default: Value,

    /// Free text shown to the model
    #[serde(default)]
    pub description: String,
}

impl SocketSpec {
    pub fn float(min: f64, max: f64, default: f64) -> Self {
        Self {
            ty: SocketType::Float,
            min: Some(min),
            max: Some(max),
            default: Value::from(default),
            description: String::new(),
        }
    }

    pub fn integer(min: i64, max: i64, default: i64) -> Self {
        Self {
            ty: SocketType::Integer,
            min: Some(min as f64),
            max: Some(max as f64),
            default: Value::from(default),
            description: String::new(),
        }
    }

    pub fn boolean(default: bool) -> Self {
        Self {
            ty: SocketType::Bool,
            min: None,
            max: None,
            default: Value::Bool(default),
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Errors found while loading or checking a schema
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchemaError {
    #[error("failed to parse schema: {0}")]
    Parse(String),
    #[error("key '{key}': min is greater than max")]
    InvertedRange { key: String },
    #[error("key '{key}': default must be a {expected}")]
    DefaultType { key: String, expected: &'static str },
    #[error("key '{key}': default {default} is outside [{min}, {max}]")]
    DefaultOutOfRange {
        key: String,
        default: f64,
        min: f64,
        max: f64,
    },
}

/// Ordered mapping from key to [`SocketSpec`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entries: Vec<(String, SocketSpec)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, spec: SocketSpec) -> Self {
        self.insert(key, spec);
        self
    }

    /// Insert or replace a spec. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, spec: SocketSpec) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = spec,
            None => self.entries.push((key, spec)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SocketSpec> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, spec)| spec)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SocketSpec)> {
        self.entries.iter().map(|(k, spec)| (k.as_str(), spec))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default value for every key
    pub fn defaults(&self) -> Params {
        self.iter()
            .map(|(k, spec)| (k.to_string(), spec.default.clone()))
            .collect()
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaError> {
        serde_yaml::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    /// Check that numeric defaults lie inside their bounds and bool defaults are booleans.
    pub fn check(&self) -> Result<(), SchemaError> {
        for (key, spec) in self.iter() {
            match spec.ty {
                SocketType::Float | SocketType::Integer => {
                    let default = spec.default.as_f64().ok_or_else(|| SchemaError::DefaultType {
                        key: key.to_string(),
                        expected: "number",
                    })?;
                    let min = spec.min.unwrap_or(default);
                    let max = spec.max.unwrap_or(default);
                    if min > max {
                        return Err(SchemaError::InvertedRange {
                            key: key.to_string(),
                        });
                    }
                    if default < min || default > max {
                        return Err(SchemaError::DefaultOutOfRange {
                            key: key.to_string(),
                            default,
                            min,
                            max,
                        });
                    }
                }
                SocketType::Bool => {
                    if !spec.default.is_boolean() {
                        return Err(SchemaError::DefaultType {
                            key: key.to_string(),
                            expected: "boolean",
                        });
                    }
                }
                SocketType::Unknown => {}
            }
        }
        Ok(())
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, spec) in &self.entries {
            map.serialize_entry(key, spec)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Schema;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of parameter key to socket spec")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Schema, A::Error> {
                let mut schema = Schema::new();
                while let Some((key, spec)) = access.next_entry::<String, SocketSpec>()? {
                    schema.insert(key, spec);
                }
                Ok(schema)
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_order_is_preserved() {
        let schema = Schema::from_json_str(
            r#"{
                "zeta": {"type": "float", "min": 0, "max": 1, "default": 0.5},
                "alpha": {"type": "bool", "default": true},
                "mid": {"type": "integer", "min": 1, "max": 5, "default": 3}
            }"#,
        )
        .unwrap();

        let keys: Vec<&str> = schema.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_yaml_schema() {
        let schema = Schema::from_yaml_str(concat!(
            "trunk_length:\n",
            "  type: float\n  min: 0.0\n  max: 40.0\n  default: 4.0\n",
            "  description: total trunk length\n",
            "leaves:\n  type: bool\n  default: true\n",
        ))
        .unwrap();

        assert_eq!(schema.len(), 2);
        let spec = schema.get("trunk_length").unwrap();
        assert_eq!(spec.ty, SocketType::Float);
        assert_eq!(spec.max, Some(40.0));
        assert_eq!(spec.description, "total trunk length");
        assert!(schema.check().is_ok());
    }

    #[test]
    fn test_unknown_type_is_accepted() {
        let schema =
            Schema::from_json_str(r#"{"color": {"type": "rgba", "default": [1, 0, 0, 1]}}"#)
                .unwrap();
        assert_eq!(schema.get("color").unwrap().ty, SocketType::Unknown);
    }

    #[test]
    fn test_serialize_keeps_order() {
        let schema = Schema::new()
            .with("b", SocketSpec::boolean(false))
            .with("a", SocketSpec::float(0.0, 1.0, 0.5));

        let text = serde_json::to_string(&schema).unwrap();
        assert!(text.find("\"b\"").unwrap() < text.find("\"a\"").unwrap());
        assert_eq!(Schema::from_json_str(&text).unwrap(), schema);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut schema = Schema::new()
            .with("a", SocketSpec::boolean(false))
            .with("b", SocketSpec::boolean(false));
        schema.insert("a", SocketSpec::boolean(true));

        let keys: Vec<&str> = schema.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(schema.get("a").unwrap().default, Value::Bool(true));
    }

    #[test]
    fn test_check_rejects_default_out_of_range() {
        let schema = Schema::new().with("x", SocketSpec::float(0.0, 1.0, 2.0));
        assert!(matches!(
            schema.check(),
            Err(SchemaError::DefaultOutOfRange { .. })
        ));
    }

    #[test]
    fn test_check_rejects_inverted_range() {
        let mut spec = SocketSpec::float(0.0, 1.0, 0.5);
        spec.min = Some(2.0);
        let schema = Schema::new().with("x", spec);
        assert_eq!(
            schema.check(),
            Err(SchemaError::InvertedRange {
                key: "x".to_string()
            })
        );
    }

    #[test]
    fn test_check_rejects_non_bool_default() {
        let mut spec = SocketSpec::boolean(true);
        spec.default = Value::from(1);
        let schema = Schema::new().with("flag", spec);
        assert!(matches!(schema.check(), Err(SchemaError::DefaultType { .. })));
    }

    #[test]
    fn test_defaults() {
        let schema = Schema::new()
            .with("x", SocketSpec::float(0.0, 10.0, 5.0))
            .with("flag", SocketSpec::boolean(true));
        let defaults = schema.defaults();
        assert_eq!(defaults["x"], Value::from(5.0));
        assert_eq!(defaults["flag"], Value::Bool(true));
    }
}
