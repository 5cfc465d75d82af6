//! Tagged configuration value with best-effort coercion.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A single configuration entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ConfigValue {
    #[default]
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    /// Coerce to a boolean. Strings accept true/false, 1/0, yes/no, on/off.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Absent => None,
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" | "" => Some(false),
                _ => None,
            },
        }
    }

    /// Coerce to an integer. Floats truncate toward zero.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Absent => None,
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Self::Float(_) => None,
            Self::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            }
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Absent => None,
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Absent => None,
            Self::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn bool_or(&self, default: bool) -> bool {
        self.as_bool().unwrap_or(default)
    }

    pub fn int_or(&self, default: i64) -> i64 {
        self.as_int().unwrap_or(default)
    }

    pub fn float_or(&self, default: f64) -> f64 {
        self.as_float().unwrap_or(default)
    }

    pub fn string_or(&self, default: &str) -> String {
        self.as_string().unwrap_or_else(|| default.to_string())
    }

    /// JSON representation. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Absent => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    /// Convert a JSON scalar. Arrays and objects are not representable.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Absent),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(i64::try_from(u).map(Self::Int).unwrap_or(Self::Float(u as f64)))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, ""),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for ConfigValue {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl<T: Into<ConfigValue>> From<Option<T>> for ConfigValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Absent)
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value)
            .ok_or_else(|| serde::de::Error::custom("configuration values must be scalars"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_bool_coercion() {
        for truthy in ["true", "1", "yes", "YES", " on "] {
            assert_eq!(ConfigValue::from(truthy).as_bool(), Some(true), "{truthy}");
        }
        for falsy in ["false", "0", "no", "off"] {
            assert_eq!(ConfigValue::from(falsy).as_bool(), Some(false), "{falsy}");
        }
        assert_eq!(ConfigValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(ConfigValue::from("42").as_int(), Some(42));
        assert_eq!(ConfigValue::from("2.9").as_int(), Some(2));
        assert_eq!(ConfigValue::Float(-3.7).as_int(), Some(-3));
        assert_eq!(ConfigValue::Bool(true).as_int(), Some(1));
        assert_eq!(ConfigValue::Int(3).as_float(), Some(3.0));
        assert_eq!(ConfigValue::from("0.25").as_float(), Some(0.25));
        assert_eq!(ConfigValue::from("abc").as_int(), None);
    }

    #[test]
    fn absent_falls_back_to_default() {
        let value = ConfigValue::Absent;
        assert_eq!(value.int_or(7), 7);
        assert!(value.bool_or(true));
        assert_eq!(value.string_or("x"), "x");
        assert_eq!(value.as_string(), None);
    }

    #[test]
    fn stringify_scalars() {
        assert_eq!(ConfigValue::Int(8000).as_string().as_deref(), Some("8000"));
        assert_eq!(ConfigValue::Bool(false).as_string().as_deref(), Some("false"));
    }

    #[test]
    fn json_preserves_int_and_float() {
        let values = [
            ConfigValue::Int(1),
            ConfigValue::Float(1.0),
            ConfigValue::Float(0.95),
            ConfigValue::Bool(true),
            ConfigValue::from("gpu"),
        ];
        for value in values {
            let text = serde_json::to_string(&value).unwrap();
            let parsed: ConfigValue = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, value, "{text}");
        }
    }

    #[test]
    fn nested_json_rejected() {
        assert!(ConfigValue::from_json(&serde_json::json!([1, 2])).is_none());
        assert!(serde_json::from_str::<ConfigValue>("{\"a\": 1}").is_err());
    }
}
