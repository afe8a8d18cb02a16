//! Shared property value representation
//!
//! Cached bus property values are stored as a small tagged enum instead of
//! carrying transport variant types through the engines. Numeric comparisons
//! coerce across integer widths and floats since sensor publishers are not
//! consistent about them.

use serde::{Deserialize, Serialize};
use zbus::zvariant::OwnedValue;

/// A property value as cached by the engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
}

impl PropertyValue {
    /// Convert a bus variant into a cached value. Container types are not
    /// cached and yield `None`.
    pub fn from_variant(value: &OwnedValue) -> Option<Self> {
        if let Ok(v) = bool::try_from(value) {
            return Some(Self::Bool(v));
        }
        if let Ok(v) = u8::try_from(value) {
            return Some(Self::UInt(v as u64));
        }
        if let Ok(v) = i16::try_from(value) {
            return Some(Self::Int(v as i64));
        }
        if let Ok(v) = u16::try_from(value) {
            return Some(Self::UInt(v as u64));
        }
        if let Ok(v) = i32::try_from(value) {
            return Some(Self::Int(v as i64));
        }
        if let Ok(v) = u32::try_from(value) {
            return Some(Self::UInt(v as u64));
        }
        if let Ok(v) = i64::try_from(value) {
            return Some(Self::Int(v));
        }
        if let Ok(v) = u64::try_from(value) {
            return Some(Self::UInt(v));
        }
        if let Ok(v) = f64::try_from(value) {
            return Some(Self::Double(v));
        }
        if let Ok(v) = <&str>::try_from(value) {
            return Some(Self::Str(v.to_string()));
        }
        None
    }

    /// Numeric view of the value, if it has one.
    pub fn numeric(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view, truncating doubles.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::Double(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Equality that coerces across numeric representations, used by
    /// condition predicates and count-state actions where config literals
    /// and publisher types rarely line up exactly.
    pub fn matches(&self, other: &PropertyValue) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Str(v) => write!(f, "{}", v),
        }
    }
}

/// A `(path, interface, property)` key into a property cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyKey {
    pub path: String,
    pub interface: String,
    pub property: String,
}

impl PropertyKey {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
            property: property.into(),
        }
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}.{}", self.path, self.interface, self.property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(PropertyValue::Int(42).numeric(), Some(42.0));
        assert_eq!(PropertyValue::UInt(42).numeric(), Some(42.0));
        assert_eq!(PropertyValue::Double(42.5).numeric(), Some(42.5));
        assert_eq!(PropertyValue::Bool(true).numeric(), None);
        assert_eq!(PropertyValue::Str("x".into()).numeric(), None);
    }

    #[test]
    fn test_matches_across_widths() {
        assert!(PropertyValue::Int(3).matches(&PropertyValue::UInt(3)));
        assert!(PropertyValue::Double(3.0).matches(&PropertyValue::Int(3)));
        assert!(!PropertyValue::Int(3).matches(&PropertyValue::Int(4)));
        assert!(PropertyValue::Bool(true).matches(&PropertyValue::Bool(true)));
        assert!(!PropertyValue::Bool(true).matches(&PropertyValue::Int(1)));
        assert!(PropertyValue::Str("On".into()).matches(&PropertyValue::Str("On".into())));
    }

    #[test]
    fn test_untagged_deserialization() {
        let v: PropertyValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, PropertyValue::Bool(true));
        let v: PropertyValue = serde_json::from_str("10500").unwrap();
        assert_eq!(v.as_i64(), Some(10500));
        let v: PropertyValue = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(v.as_str(), Some("Running"));
    }
}
