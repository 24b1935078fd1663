//! Variable sets and their `-var` marshaling.
//!
//! A [`VariableSet`] is the flat key → value map handed to a module
//! invocation. Values are scalars or string lists; anything else that
//! arrives from a JSON declaration is kept as [`VarValue::Unsupported`] and
//! rejected when the set is marshaled, so the failure surfaces as the test
//! case's outcome instead of aborting the whole suite load.
//!
//! # Argument Mapping
//!
//! | Value            | Arguments                              |
//! |------------------|----------------------------------------|
//! | `String("a")`    | `-var`, `key=a`                        |
//! | `Bool(false)`    | `-var`, `key=false`                    |
//! | `Int(3)`         | `-var`, `key=3`                        |
//! | `List([a, b])`   | `-var`, `key=["a","b"]` (HCL list)     |
//! | `List([a, b])`   | `-var`, `key=a`, `-var`, `key=b` (repeated) |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::MarshalError;

/// A single variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    String(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
    /// Declared value with no `-var` form (mapping, null, float, mixed list).
    Unsupported(serde_json::Value),
}

impl VarValue {
    /// Short type name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            VarValue::String(_) => "string",
            VarValue::Bool(_) => "bool",
            VarValue::Int(_) => "integer",
            VarValue::List(_) => "list",
            VarValue::Unsupported(value) => match value {
                serde_json::Value::Object(_) => "mapping",
                serde_json::Value::Null => "null",
                serde_json::Value::Number(_) => "non-integer number",
                serde_json::Value::Array(_) => "list of non-strings",
                serde_json::Value::String(_) | serde_json::Value::Bool(_) => "scalar",
            },
        }
    }
}

impl From<&str> for VarValue {
    fn from(s: &str) -> Self {
        VarValue::String(s.to_string())
    }
}

impl From<String> for VarValue {
    fn from(s: String) -> Self {
        VarValue::String(s)
    }
}

impl From<bool> for VarValue {
    fn from(b: bool) -> Self {
        VarValue::Bool(b)
    }
}

impl From<i64> for VarValue {
    fn from(i: i64) -> Self {
        VarValue::Int(i)
    }
}

impl From<i32> for VarValue {
    fn from(i: i32) -> Self {
        VarValue::Int(i64::from(i))
    }
}

impl From<Vec<String>> for VarValue {
    fn from(items: Vec<String>) -> Self {
        VarValue::List(items)
    }
}

impl From<&[&str]> for VarValue {
    fn from(items: &[&str]) -> Self {
        VarValue::List(items.iter().map(|s| s.to_string()).collect())
    }
}

impl From<serde_json::Value> for VarValue {
    /// Same mapping as deserializing the value directly.
    fn from(value: serde_json::Value) -> Self {
        if let Some(i) = value.as_i64() {
            return VarValue::Int(i);
        }

        match value {
            serde_json::Value::String(s) => VarValue::String(s),
            serde_json::Value::Bool(b) => VarValue::Bool(b),
            serde_json::Value::Array(items) if items.iter().all(|v| v.is_string()) => {
                VarValue::List(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            serde_json::Value::String(s) => Some(s),
                            _ => None,
                        })
                        .collect(),
                )
            }
            other => VarValue::Unsupported(other),
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::String(s) => write!(f, "{}", s),
            VarValue::Bool(b) => write!(f, "{}", b),
            VarValue::Int(i) => write!(f, "{}", i),
            VarValue::List(items) => write!(f, "{}", hcl_list(items)),
            VarValue::Unsupported(value) => write!(f, "{}", value),
        }
    }
}

/// How list values become arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListStyle {
    /// One `-var key=["a","b"]` argument.
    #[default]
    HclList,
    /// One `-var key=elem` per element.
    RepeatedFlags,
}

/// Immutable, flat key → value map passed to one module invocation.
///
/// Keys are kept sorted so marshaling is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableSet {
    vars: BTreeMap<String, VarValue>,
}

impl VariableSet {
    /// An empty set (the orchestrated backend injects nothing).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> VariableSetBuilder {
        VariableSetBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.vars.get(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VarValue)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Marshal every entry into `-var key=value` arguments.
    ///
    /// # Errors
    ///
    /// - `InvalidKey` for empty keys or keys containing `=` or whitespace
    /// - `UnsupportedValue` for values with no argument form
    pub fn to_cli_args(&self, style: ListStyle) -> Result<Vec<String>, MarshalError> {
        let mut args = Vec::with_capacity(self.vars.len() * 2);

        for (key, value) in &self.vars {
            validate_key(key)?;

            match value {
                VarValue::String(s) => push_var(&mut args, key, s),
                VarValue::Bool(b) => push_var(&mut args, key, if *b { "true" } else { "false" }),
                VarValue::Int(i) => push_var(&mut args, key, &i.to_string()),
                VarValue::List(items) => match style {
                    ListStyle::HclList => push_var(&mut args, key, &hcl_list(items)),
                    ListStyle::RepeatedFlags => {
                        for item in items {
                            push_var(&mut args, key, item);
                        }
                    }
                },
                VarValue::Unsupported(_) => {
                    return Err(MarshalError::UnsupportedValue {
                        key: key.clone(),
                        kind: value.kind(),
                    });
                }
            }
        }

        Ok(args)
    }
}

impl<K: Into<String>, V: Into<VarValue>> FromIterator<(K, V)> for VariableSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Builder for [`VariableSet`]; the set is frozen by [`build`](Self::build).
#[derive(Debug, Default)]
pub struct VariableSetBuilder {
    vars: BTreeMap<String, VarValue>,
}

impl VariableSetBuilder {
    /// Set `key`, replacing any earlier value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<VarValue>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableSet {
        VariableSet { vars: self.vars }
    }
}

fn validate_key(key: &str) -> Result<(), MarshalError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.contains('=') {
        "key contains '='"
    } else if key.chars().any(char::is_whitespace) {
        "key contains whitespace"
    } else {
        return Ok(());
    };

    Err(MarshalError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

fn push_var(args: &mut Vec<String>, key: &str, value: &str) {
    args.push("-var".to_string());
    args.push(format!("{}={}", key, value));
}

/// `["a","b"]`; JSON string escaping is valid HCL.
fn hcl_list(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| serde_json::Value::String(item.clone()).to_string())
        .collect();
    format!("[{}]", quoted.join(","))
}
