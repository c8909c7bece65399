use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::TransportError;

pub const ATTR_MY_TYPE: &str = "MyType";
pub const ATTR_NAME: &str = "Name";
pub const ATTR_AUTHENTICATED_IDENTITY: &str = "AuthenticatedIdentity";
pub const ATTR_CURRENT_TIME: &str = "CurrentTime";
pub const ATTR_DAEMON_START_TIME: &str = "DaemonStartTime";

/// Typed scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Integer view of the value. Reals are truncated, numeric strings are parsed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Real(value) if value.is_finite() => Some(*value as i64),
            Value::Bool(value) => Some(*value as i64),
            Value::Str(value) => {
                let value = value.trim();
                value
                    .parse::<i64>()
                    .ok()
                    .or_else(|| value.parse::<f64>().ok().map(|v| v as i64))
            }
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Real(value) => Some(*value),
            Value::Bool(value) => Some(*value as i64 as f64),
            Value::Str(value) => value.trim().parse().ok(),
        }
    }

    /// Boolean view of the value. Accepts the string spellings used by the collector.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Int(value) => Some(*value != 0),
            Value::Real(value) => Some(*value != 0.0),
            Value::Str(value) => match value.trim() {
                s if s.eq_ignore_ascii_case("true") => Some(true),
                s if s.eq_ignore_ascii_case("false") => Some(false),
                _ => None,
            },
        }
    }

    /// Renders the value in ClassAd literal syntax (strings are quoted and escaped).
    pub fn to_literal(&self) -> String {
        match self {
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Int(value) => value.to_string(),
            Value::Real(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{value:.1}")
                } else {
                    value.to_string()
                }
            }
            Value::Str(value) => quote_string(value),
        }
    }

    fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Real)),
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(value) => f.write_str(value),
            value => f.write_str(&value.to_literal()),
        }
    }
}

pub fn quote_string(value: &str) -> String {
    let mut output = String::with_capacity(value.len() + 2);
    output.push('"');
    for c in value.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            c => output.push(c),
        }
    }
    output.push('"');
    output
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(value.min(i64::MAX as u64) as i64)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value.min(i64::MAX as usize) as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Str(value.clone())
    }
}

/// A string-keyed map of typed scalars with a mandatory `MyType` discriminator.
///
/// Attribute names keep the spelling they were inserted with; lookups fall back to a
/// case-insensitive match, as the collector treats names case-insensitively.
/// Attributes are stored in a sorted map so that the rendered form of an ad is stable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassAd {
    attrs: BTreeMap<String, Value>,
}

impl ClassAd {
    pub fn new(my_type: &str, name: &str) -> Self {
        let mut ad = ClassAd::default();
        ad.insert(ATTR_MY_TYPE, my_type);
        ad.insert(ATTR_NAME, name);
        ad
    }

    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        let key = key.into();
        if !self.attrs.contains_key(&key) {
            if let Some(existing) = self.find_key(&key).map(|k| k.to_string()) {
                self.attrs.remove(&existing);
            }
        }
        self.attrs.insert(key, value.into());
    }

    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let key = self.find_key(key)?.to_string();
        self.attrs.remove(&key)
    }

    fn find_key(&self, key: &str) -> Option<&str> {
        if let Some((k, _)) = self.attrs.get_key_value(key) {
            return Some(k);
        }
        self.attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .map(|k| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key).or_else(|| {
            self.attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.as_int())
    }

    pub fn get_real(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_real())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    pub fn my_type(&self) -> &str {
        self.get_str(ATTR_MY_TYPE).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.get_str(ATTR_NAME).unwrap_or_default()
    }

    pub fn authenticated_identity(&self) -> Option<&str> {
        self.get_str(ATTR_AUTHENTICATED_IDENTITY)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates attributes whose name starts with `prefix`, yielding the name without it.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.attrs
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|suffix| (suffix, v)))
    }

    /// Keeps only the named attributes (plus `MyType` and `Name`).
    pub fn project(&mut self, attributes: &[String]) {
        self.attrs.retain(|k, _| {
            k == ATTR_MY_TYPE
                || k == ATTR_NAME
                || attributes.iter().any(|a| a.eq_ignore_ascii_case(k))
        });
    }

    /// Renders the ad in the long `Name = literal` format accepted by the collector tools.
    pub fn to_long_form(&self) -> String {
        let mut output = String::new();
        for (key, value) in &self.attrs {
            output.push_str(key);
            output.push_str(" = ");
            output.push_str(&value.to_literal());
            output.push('\n');
        }
        output
    }

    /// Builds an ad from one JSON object as printed by the collector query tools.
    /// Non-scalar values (lists, nested ads, unevaluated expressions) are skipped.
    pub fn from_json(value: &serde_json::Value) -> Result<ClassAd, TransportError> {
        let object = value
            .as_object()
            .ok_or_else(|| TransportError::InvalidAd("ClassAd is not a JSON object".into()))?;
        let mut ad = ClassAd::default();
        for (key, value) in object {
            match Value::from_json(value) {
                Some(Value::Str(s)) if s.starts_with("/Expr(") => {}
                Some(value) => {
                    ad.attrs.insert(key.clone(), value);
                }
                None => {}
            }
        }
        if ad.get_str(ATTR_MY_TYPE).is_none() {
            return Err(TransportError::InvalidAd(format!(
                "ClassAd {} has no {ATTR_MY_TYPE}",
                ad.name()
            )));
        }
        Ok(ad)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ClassAd {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ad = ClassAd::default();
        for (key, value) in iter {
            ad.insert(key, value);
        }
        ad
    }
}
