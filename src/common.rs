//! Common attribute types shared by spans and events.

use std::borrow::Cow;
use std::fmt;

/// The key part of attribute key-value pairs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Cow<'static, str>);

impl Key {
    /// Create a new `Key`.
    pub fn new(value: impl Into<Cow<'static, str>>) -> Self {
        Key(value.into())
    }

    /// Create a new const `Key`.
    pub const fn from_static_str(value: &'static str) -> Self {
        Key(Cow::Borrowed(value))
    }

    /// Returns a reference to the underlying key name.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<&'static str> for Key {
    fn from(key_str: &'static str) -> Self {
        Key(Cow::Borrowed(key_str))
    }
}

impl From<String> for Key {
    fn from(string: String) -> Self {
        Key(Cow::Owned(string))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.0.as_ref())
    }
}

/// The value part of attribute key-value pairs.
///
/// Deliberately closed to four scalar kinds so the export serialization is
/// unambiguous.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// bool values
    Bool(bool),
    /// i64 values
    I64(i64),
    /// f64 values
    F64(f64),
    /// String values
    String(Cow<'static, str>),
}

impl Value {
    /// String representation of the value, used for error events and logs.
    pub fn as_string(&self) -> String {
        match self {
            Value::Bool(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F64(v) => v.to_string(),
            Value::String(v) => v.to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(val: bool) -> Self {
        Value::Bool(val)
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Self {
        Value::I64(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Value::F64(val)
    }
}

impl From<&'static str> for Value {
    fn from(val: &'static str) -> Self {
        Value::String(Cow::Borrowed(val))
    }
}

impl From<String> for Value {
    fn from(val: String) -> Self {
        Value::String(Cow::Owned(val))
    }
}

/// A key-value pair describing an aspect of a span or event.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    /// The attribute name
    pub key: Key,
    /// The attribute value
    pub value: Value,
}

impl KeyValue {
    /// Create a new `KeyValue` pair.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42_i64), Value::I64(42));
        assert_eq!(Value::from(1.5_f64), Value::F64(1.5));
        assert_eq!(Value::from("static"), Value::String("static".into()));
        assert_eq!(
            Value::from(String::from("owned")),
            Value::String("owned".into())
        );
    }

    #[test]
    fn key_value_new() {
        let kv = KeyValue::new("http.method", "GET");
        assert_eq!(kv.key.as_str(), "http.method");
        assert_eq!(kv.value, Value::String("GET".into()));
    }
}
