//! Typed values exchanged with remote objects.
//!
//! `R` is how a remote-object reference is held on this side of the wire:
//! live object handles on the server, proxies on the client.

use crate::{Result, RomError};

/// A typed parameter, return value or event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RomValue<R> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// One constant of a declared enum type.
    Enum(String),
    Object(R),
    List(Vec<RomValue<R>>),
    Struct(ParamMap<R>),
}

impl<R> RomValue<R> {
    pub fn object(object: R) -> Self {
        RomValue::Object(object)
    }

    pub fn enumeration(constant: impl Into<String>) -> Self {
        RomValue::Enum(constant.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RomValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RomValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RomValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RomValue::Float(f) => Some(*f),
            RomValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String or enum constant.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RomValue::String(s) | RomValue::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&R> {
        match self {
            RomValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RomValue<R>]> {
        match self {
            RomValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&ParamMap<R>> {
        match self {
            RomValue::Struct(map) => Some(map),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RomValue::Null => "null",
            RomValue::Bool(_) => "boolean",
            RomValue::Int(_) => "integer",
            RomValue::Float(_) => "float",
            RomValue::String(_) => "string",
            RomValue::Enum(_) => "enum",
            RomValue::Object(_) => "remote object",
            RomValue::List(_) => "list",
            RomValue::Struct(_) => "struct",
        }
    }
}

impl<R> From<bool> for RomValue<R> {
    fn from(v: bool) -> Self {
        RomValue::Bool(v)
    }
}

impl<R> From<i64> for RomValue<R> {
    fn from(v: i64) -> Self {
        RomValue::Int(v)
    }
}

impl<R> From<i32> for RomValue<R> {
    fn from(v: i32) -> Self {
        RomValue::Int(v.into())
    }
}

impl<R> From<u32> for RomValue<R> {
    fn from(v: u32) -> Self {
        RomValue::Int(v.into())
    }
}

impl<R> From<f64> for RomValue<R> {
    fn from(v: f64) -> Self {
        RomValue::Float(v)
    }
}

impl<R> From<&str> for RomValue<R> {
    fn from(v: &str) -> Self {
        RomValue::String(v.to_string())
    }
}

impl<R> From<String> for RomValue<R> {
    fn from(v: String) -> Self {
        RomValue::String(v)
    }
}

impl<R> From<Vec<RomValue<R>>> for RomValue<R> {
    fn from(v: Vec<RomValue<R>>) -> Self {
        RomValue::List(v)
    }
}

impl<R> From<ParamMap<R>> for RomValue<R> {
    fn from(v: ParamMap<R>) -> Self {
        RomValue::Struct(v)
    }
}

/// Named parameters in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamMap<R> {
    entries: Vec<(String, RomValue<R>)>,
}

impl<R> Default for ParamMap<R> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<R> ParamMap<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<RomValue<R>>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace `name`, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<RomValue<R>>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RomValue<R>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<RomValue<R>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RomValue<R>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    fn require(&self, name: &str) -> Result<&RomValue<R>> {
        self.get(name)
            .ok_or_else(|| RomError::protocol(format!("missing parameter '{}'", name)))
    }

    fn mismatch(name: &str, expected: &str, got: &RomValue<R>) -> RomError {
        RomError::protocol(format!(
            "parameter '{}' must be {}, got {}",
            name,
            expected,
            got.kind()
        ))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        let value = self.require(name)?;
        value
            .as_str()
            .ok_or_else(|| Self::mismatch(name, "a string", value))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        let value = self.require(name)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(name, "a boolean", value))
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        let value = self.require(name)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(name, "an integer", value))
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        let value = self.require(name)?;
        value
            .as_f64()
            .ok_or_else(|| Self::mismatch(name, "a number", value))
    }

    pub fn object(&self, name: &str) -> Result<&R> {
        let value = self.require(name)?;
        value
            .as_object()
            .ok_or_else(|| Self::mismatch(name, "a remote object", value))
    }

    pub fn list(&self, name: &str) -> Result<&[RomValue<R>]> {
        let value = self.require(name)?;
        value
            .as_list()
            .ok_or_else(|| Self::mismatch(name, "a list", value))
    }
}

impl<R> IntoIterator for ParamMap<R> {
    type Item = (String, RomValue<R>);
    type IntoIter = std::vec::IntoIter<(String, RomValue<R>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<R, K: Into<String>> FromIterator<(K, RomValue<R>)> for ParamMap<R> {
    fn from_iter<I: IntoIterator<Item = (K, RomValue<R>)>>(iter: I) -> Self {
        let mut map = ParamMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Value = RomValue<String>;

    #[test]
    fn test_param_map_keeps_declaration_order() {
        let params: ParamMap<String> = ParamMap::new()
            .with("b", 1)
            .with("a", "x")
            .with("b", 2);
        let names: Vec<&str> = params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(params.i64("b").unwrap(), 2);
    }

    #[test]
    fn test_typed_accessors() {
        let params: ParamMap<String> = ParamMap::new()
            .with("color", "red")
            .with("size", 3)
            .with("ratio", 0.5)
            .with("on", true)
            .with("peer", Value::object("w-1".to_string()));

        assert_eq!(params.str("color").unwrap(), "red");
        assert_eq!(params.f64("size").unwrap(), 3.0);
        assert_eq!(params.f64("ratio").unwrap(), 0.5);
        assert!(params.bool("on").unwrap());
        assert_eq!(params.object("peer").unwrap(), "w-1");

        assert!(matches!(params.str("size"), Err(RomError::Protocol { .. })));
        assert!(matches!(params.str("missing"), Err(RomError::Protocol { .. })));
    }

    #[test]
    fn test_enum_reads_as_str() {
        let v: Value = RomValue::enumeration("PLAYING");
        assert_eq!(v.as_str(), Some("PLAYING"));
        assert_eq!(v.kind(), "enum");
    }
}
