//! Typed property values and health categories.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A decoded value, as stored in the property cache or extracted from a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag (coils, limit switches, status bits).
    Bool(bool),
    /// Integer reading.
    Int(i64),
    /// Floating point reading.
    Float(f64),
    /// Free text.
    Text(String),
    /// Device-reported time of day, without zone.
    Timestamp(NaiveDateTime),
    /// Repeated sub-pattern, one entry per occurrence.
    List(Vec<Fields>),
}

/// Named fields decoded from one reply.
pub type Fields = BTreeMap<String, Value>;

impl Value {
    /// Boolean view, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. Floats are not truncated.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Numeric view for both integers and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Text view, if this is a `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(t) => write!(f, "{t}"),
            Value::List(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Health classification of a cached value.
///
/// Drives both notifications (`Error` and `Warning` raise their own events)
/// and presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Category {
    /// No valid reading (never refreshed, or the last refresh failed).
    #[default]
    Unknown,
    /// Fault condition.
    Error,
    /// Out of nominal range but not a fault.
    Warning,
    /// Healthy.
    Ok,
    /// Plain reading with no health meaning.
    Normal,
    /// Boolean true.
    Yes,
    /// Boolean false.
    No,
}

impl Category {
    /// Default mapping for properties created without a categorizer.
    pub fn default_for(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Category::Yes,
            Value::Bool(false) => Category::No,
            _ => Category::Normal,
        }
    }

    /// Map a fault flag: set means `Error`, clear means `Ok`.
    pub fn fault(set: bool) -> Self {
        if set {
            Category::Error
        } else {
            Category::Ok
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Unknown => "UNKNOWN",
            Category::Error => "ERROR",
            Category::Warning => "WARNING",
            Category::Ok => "OK",
            Category::Normal => "NORMAL",
            Category::Yes => "YES",
            Category::No => "NO",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_categories() {
        assert_eq!(Category::default_for(&Value::Bool(true)), Category::Yes);
        assert_eq!(Category::default_for(&Value::Bool(false)), Category::No);
        assert_eq!(Category::default_for(&Value::Float(1.5)), Category::Normal);
        assert_eq!(Category::default(), Category::Unknown);
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(3.5).as_int(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
    }
}
