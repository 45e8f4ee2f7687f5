//! Module configuration: string property bags with declared defaults.
//!
//! A module's configuration is a flat map from property key to string
//! value. Every key a module recognizes is declared with a description and,
//! usually, a default. Typed access goes through [`PropertySet`] getters,
//! which turn unparsable values into [`ConfigError::InvalidValue`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// A JSON-like value, used for callback payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Render as a property string. Scalars use their plain form, arrays
    /// and objects their JSON encoding, `Null` the empty string.
    pub fn to_property_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(arr: Vec<T>) -> Self {
        Value::Array(arr.into_iter().map(Into::into).collect())
    }
}

/// A module configuration snapshot: property key to string value.
pub type Properties = IndexMap<String, String>;

/// Extension trait for building Properties ergonomically.
pub trait PropertiesExt {
    fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self;
}

impl PropertiesExt for Properties {
    fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while validating or reading configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for property '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing required property '{0}'")]
    MissingRequired(String),

    #[error("unknown property '{0}'")]
    UnknownProperty(String),
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Display) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Description of one recognized property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub key: String,
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Current values plus the declared keys, defaults and descriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertySet {
    values: Properties,
    defaults: Properties,
    descriptions: IndexMap<String, String>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key without default; it must be configured before use.
    pub fn declare(&mut self, key: impl Into<String>, description: impl Into<String>) {
        self.descriptions.insert(key.into(), description.into());
    }

    /// Declare a key with a default value.
    pub fn declare_default(
        &mut self,
        key: impl Into<String>,
        default: impl Into<String>,
        description: impl Into<String>,
    ) {
        let key = key.into();
        self.defaults.insert(key.clone(), default.into());
        self.descriptions.insert(key, description.into());
    }

    /// Replace the default of an already declared key.
    pub fn set_default(&mut self, key: &str, default: impl Into<String>) -> Result<(), ConfigError> {
        if !self.is_declared(key) {
            return Err(ConfigError::UnknownProperty(key.to_string()));
        }
        self.defaults.insert(key.to_string(), default.into());
        Ok(())
    }

    pub fn is_declared(&self, key: &str) -> bool {
        self.descriptions.contains_key(key)
    }

    /// Set a declared key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), ConfigError> {
        if !self.is_declared(key) {
            return Err(ConfigError::UnknownProperty(key.to_string()));
        }
        self.values.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Merge a configuration snapshot without checking keys.
    ///
    /// Unknown keys are reported later by [`validate`](Self::validate).
    pub fn merge(&mut self, config: Properties) {
        self.values.extend(config);
    }

    /// Value if set, otherwise the default.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .or_else(|| self.defaults.get(key))
            .map(String::as_str)
    }

    /// Explicitly configured value only.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn default_value(&self, key: &str) -> Option<&str> {
        self.defaults.get(key).map(String::as_str)
    }

    pub fn description(&self, key: &str) -> Option<&str> {
        self.descriptions.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &Properties {
        &self.values
    }

    /// Fill every unset declared key that has a default.
    pub fn apply_defaults(&mut self) {
        for (key, default) in &self.defaults {
            if !self.values.contains_key(key) {
                self.values.insert(key.clone(), default.clone());
            }
        }
    }

    /// Reject configured keys that were never declared.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.values.keys().find(|key| !self.is_declared(key)) {
            Some(key) => Err(ConfigError::UnknownProperty(key.clone())),
            None => Ok(()),
        }
    }

    /// A value that must be present (set or defaulted).
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
    }

    /// Parse a required value.
    pub fn get_parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.require(key)?;
        raw.trim()
            .parse()
            .map_err(|e| ConfigError::invalid(key, raw, e))
    }

    /// A required value restricted to an enumerated set (case-insensitive).
    pub fn get_choice<'a>(&self, key: &str, choices: &[&'a str]) -> Result<&'a str, ConfigError> {
        let raw = self.require(key)?;
        choices
            .iter()
            .find(|choice| choice.eq_ignore_ascii_case(raw.trim()))
            .copied()
            .ok_or_else(|| ConfigError::invalid(key, raw, format!("expected one of [{}]", choices.join("|"))))
    }

    /// A required boolean (`true/false`, `yes/no`, `on/off`, `1/0`).
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self.require(key)?;
        match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
        }
    }

    /// Every declared key with its description, default and value.
    pub fn declared(&self) -> Vec<PropertyInfo> {
        self.descriptions
            .iter()
            .map(|(key, description)| PropertyInfo {
                key: key.clone(),
                description: description.clone(),
                default: self.defaults.get(key).cloned(),
                value: self.values.get(key).cloned(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format_set() -> PropertySet {
        let mut set = PropertySet::new();
        set.declare_default("format", "csv", "Format of input [json|csv].");
        set.declare("path", "File to read.");
        set.declare_default("count", "3", "How many.");
        set
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i64), Value::Int(42));
        assert_eq!(Value::from(3.15f64), Value::Float(3.15));
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
    }

    #[test]
    fn test_property_strings() {
        assert_eq!(Value::Int(2).to_property_string(), "2");
        assert_eq!(Value::Bool(false).to_property_string(), "false");
        assert_eq!(Value::from("[,;]").to_property_string(), "[,;]");
        assert_eq!(Value::Null.to_property_string(), "");
        assert_eq!(Value::from(vec![1i64, 2]).to_property_string(), "[1,2]");
    }

    #[test]
    fn test_properties_builder() {
        let props = Properties::new()
            .with("format", "csv")
            .with("input delimiter regex", "[,;]");

        assert_eq!(props.get("format").map(String::as_str), Some("csv"));
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_value_accessors() {
        let v = Value::Int(42);
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));
        assert_eq!(v.as_str(), None);
    }

    #[test]
    fn test_default_fills_missing_value() {
        let mut set = format_set();
        assert_eq!(set.value("format"), None);

        set.apply_defaults();
        assert_eq!(set.value("format"), Some("csv"));
        assert_eq!(set.get("format"), Some("csv"));
    }

    #[test]
    fn test_explicit_value_wins_over_default() {
        let mut set = format_set();
        set.set("format", "json").unwrap();
        set.apply_defaults();
        assert_eq!(set.get("format"), Some("json"));
    }

    #[test]
    fn test_unknown_keys() {
        let mut set = format_set();
        assert_eq!(
            set.set("colour", "red"),
            Err(ConfigError::UnknownProperty("colour".into()))
        );

        set.merge(Properties::new().with("colour", "red"));
        assert_eq!(
            set.validate(),
            Err(ConfigError::UnknownProperty("colour".into()))
        );
    }

    #[test]
    fn test_required_without_default() {
        let set = format_set();
        assert_eq!(
            set.require("path"),
            Err(ConfigError::MissingRequired("path".into()))
        );
    }

    #[test]
    fn test_typed_getters() {
        let mut set = format_set();
        assert_eq!(set.get_parsed::<usize>("count"), Ok(3));

        set.set("count", "many").unwrap();
        assert!(matches!(
            set.get_parsed::<usize>("count"),
            Err(ConfigError::InvalidValue { .. })
        ));

        set.set("format", "JSON").unwrap();
        assert_eq!(set.get_choice("format", &["json", "csv"]), Ok("json"));

        set.set("format", "xml").unwrap();
        assert!(matches!(
            set.get_choice("format", &["json", "csv"]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_bool_getter() {
        let mut set = PropertySet::new();
        set.declare_default("append", "no", "Append instead of truncating.");
        assert_eq!(set.get_bool("append"), Ok(false));

        set.set("append", "Yes").unwrap();
        assert_eq!(set.get_bool("append"), Ok(true));

        set.set("append", "maybe").unwrap();
        assert!(set.get_bool("append").is_err());
    }

    #[test]
    fn test_declared_listing() {
        let set = format_set();
        let declared = set.declared();
        assert_eq!(declared.len(), 3);
        assert_eq!(declared[0].key, "format");
        assert_eq!(declared[0].default.as_deref(), Some("csv"));
        assert_eq!(declared[1].default, None);
    }
}
