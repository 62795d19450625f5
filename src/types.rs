//! Value types shared by the settings core, the services and the bus

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single data point value as it appears on the bus and in the store.
///
/// Serialized untagged so it shows up as a bare scalar in both the JSON
/// wire frames and the TOML settings file. Variant order matters: a whole
/// number deserializes as `Int`, not `Float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view used for bounds checks. Text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

/// Inclusive numeric bounds for a setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Setting metadata carried by a persisted exported field.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingSpec {
    pub default: FieldValue,
    pub bounds: Option<Bounds>,
}

impl SettingSpec {
    pub fn new(default: impl Into<FieldValue>) -> Self {
        Self {
            default: default.into(),
            bounds: None,
        }
    }

    pub fn bounded(default: impl Into<FieldValue>, min: f64, max: f64) -> Self {
        Self {
            default: default.into(),
            bounds: Some(Bounds::new(min, max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_numbers_deserialize_as_int() {
        let v: FieldValue = serde_json::from_str("500").unwrap();
        assert_eq!(v, FieldValue::Int(500));

        let v: FieldValue = serde_json::from_str("0.75").unwrap();
        assert_eq!(v, FieldValue::Float(0.75));

        let v: FieldValue = serde_json::from_str("\"Fresh Water\"").unwrap();
        assert_eq!(v, FieldValue::Text("Fresh Water".to_string()));
    }

    #[test]
    fn test_numeric_view() {
        assert_eq!(FieldValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(FieldValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::from("x").as_f64(), None);
    }

    #[test]
    fn test_bounds_inclusive() {
        let b = Bounds::new(0.0, 1000.0);
        assert!(b.contains(0.0));
        assert!(b.contains(1000.0));
        assert!(!b.contains(-0.5));
        assert!(!b.contains(1000.5));
    }
}
