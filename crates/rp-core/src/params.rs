// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tagged parameter values.
//!
//! Override files keep their loose JSON shape on disk; in memory every
//! parameter value is one of these variants, and validation is an explicit
//! function rather than duck typing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A parameter value as it appears in templates and override files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ParamValue {
    /// Text value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// List value (only in free-form metadata, never a node wire).
    List(Vec<Value>),
    /// Object value.
    Dict(BTreeMap<String, Value>),
}

impl ParamValue {
    /// Classify a raw JSON scalar/container. `None` for JSON null.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ParamValue::String(s.clone())),
            Value::Bool(b) => Some(ParamValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ParamValue::Int(i))
                } else {
                    n.as_f64().map(ParamValue::Float)
                }
            }
            Value::Array(items) => Some(ParamValue::List(items.clone())),
            Value::Object(map) => Some(ParamValue::Dict(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            Value::Null => None,
        }
    }

    /// The nominal type of this value.
    pub fn nominal_type(&self) -> NominalType {
        match self {
            ParamValue::String(_) => NominalType::Str,
            ParamValue::Int(_) => NominalType::Int,
            ParamValue::Float(_) => NominalType::Float,
            ParamValue::Bool(_) => NominalType::Bool,
            ParamValue::List(_) => NominalType::List,
            ParamValue::Dict(_) => NominalType::Dict,
        }
    }
}

/// Nominal parameter types as recorded in override files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NominalType {
    /// Text.
    Str,
    /// Integer.
    Int,
    /// Floating-point number; integers are acceptable here.
    Float,
    /// Boolean.
    Bool,
    /// List.
    List,
    /// Object.
    Dict,
}

impl NominalType {
    /// Wire name used in override files (`"str"`, `"int"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            NominalType::Str => "str",
            NominalType::Int => "int",
            NominalType::Float => "float",
            NominalType::Bool => "bool",
            NominalType::List => "list",
            NominalType::Dict => "dict",
        }
    }

    /// Parse the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "str" => Some(NominalType::Str),
            "int" => Some(NominalType::Int),
            "float" => Some(NominalType::Float),
            "bool" => Some(NominalType::Bool),
            "list" => Some(NominalType::List),
            "dict" => Some(NominalType::Dict),
            _ => None,
        }
    }

    /// Check a raw JSON value against this type. Integers pass where a float
    /// is expected; nothing else is coerced.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            NominalType::Str => value.is_string(),
            NominalType::Int => value.as_i64().is_some(),
            NominalType::Float => value.is_f64() || value.as_i64().is_some(),
            NominalType::Bool => value.is_boolean(),
            NominalType::List => value.is_array(),
            NominalType::Dict => value.is_object(),
        }
    }

    /// Human name for error messages (`"string"`, `"number"`, ...).
    pub fn human_name(&self) -> &'static str {
        match self {
            NominalType::Str => "string",
            NominalType::Int => "integer",
            NominalType::Float => "number",
            NominalType::Bool => "boolean",
            NominalType::List => "list",
            NominalType::Dict => "object",
        }
    }
}

/// Describe a JSON value's type for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.as_i64().is_some() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_matches_json_shape() {
        assert_eq!(
            ParamValue::from_json(&json!("hi")).unwrap().nominal_type(),
            NominalType::Str
        );
        assert_eq!(
            ParamValue::from_json(&json!(7)).unwrap().nominal_type(),
            NominalType::Int
        );
        assert_eq!(
            ParamValue::from_json(&json!(7.5)).unwrap().nominal_type(),
            NominalType::Float
        );
        assert_eq!(
            ParamValue::from_json(&json!(true)).unwrap().nominal_type(),
            NominalType::Bool
        );
        assert!(ParamValue::from_json(&Value::Null).is_none());
    }

    #[test]
    fn float_accepts_int_but_not_vice_versa() {
        assert!(NominalType::Float.accepts(&json!(3)));
        assert!(NominalType::Float.accepts(&json!(3.5)));
        assert!(!NominalType::Int.accepts(&json!(3.5)));
        assert!(!NominalType::Int.accepts(&json!("3")));
    }

    #[test]
    fn wire_names_roundtrip() {
        for t in [
            NominalType::Str,
            NominalType::Int,
            NominalType::Float,
            NominalType::Bool,
            NominalType::List,
            NominalType::Dict,
        ] {
            assert_eq!(NominalType::parse(t.as_str()), Some(t));
        }
        assert!(NominalType::parse("tuple").is_none());
    }

    #[test]
    fn untagged_serde_keeps_json_shape() {
        let v = ParamValue::Int(42);
        assert_eq!(serde_json::to_string(&v).unwrap(), "42");
        let back: ParamValue = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, ParamValue::String("abc".into()));
    }
}
