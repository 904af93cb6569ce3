//! Typed field values carried inside rows.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Field type of a column in a [`RowMeta`](crate::RowMeta).
///
/// The numeric tag is part of the transport wire format and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Number,
    String,
    Date,
    Boolean,
    Integer,
    BigNumber,
    Binary,
}

impl ValueType {
    /// Wire tag for this type.
    #[must_use]
    pub fn tag(self) -> i32 {
        match self {
            Self::Number => 1,
            Self::String => 2,
            Self::Date => 3,
            Self::Boolean => 4,
            Self::Integer => 5,
            Self::BigNumber => 6,
            Self::Binary => 8,
        }
    }

    /// Inverse of [`ValueType::tag`]. Returns `None` for unknown tags.
    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(Self::Number),
            2 => Some(Self::String),
            3 => Some(Self::Date),
            4 => Some(Self::Boolean),
            5 => Some(Self::Integer),
            6 => Some(Self::BigNumber),
            8 => Some(Self::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Date => "date",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::BigNumber => "big_number",
            Self::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// A single field value. `Null` is valid for every [`ValueType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    String(String),
    Integer(i64),
    Number(f64),
    Date(NaiveDateTime),
    Boolean(bool),
    Binary(Vec<u8>),
    BigNumber(BigDecimal),
}

impl Value {
    /// The type of a non-null value.
    #[must_use]
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Self::Null => None,
            Self::String(_) => Some(ValueType::String),
            Self::Integer(_) => Some(ValueType::Integer),
            Self::Number(_) => Some(ValueType::Number),
            Self::Date(_) => Some(ValueType::Date),
            Self::Boolean(_) => Some(ValueType::Boolean),
            Self::Binary(_) => Some(ValueType::Binary),
            Self::BigNumber(_) => Some(ValueType::BigNumber),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value may be stored in a field of type `ty`.
    #[must_use]
    pub fn fits(&self, ty: ValueType) -> bool {
        self.value_type().map_or(true, |own| own == ty)
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("<null>"),
            Self::String(v) => f.write_str(v),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y/%m/%d %H:%M:%S%.3f")),
            Self::Boolean(v) => f.write_str(if *v { "Y" } else { "N" }),
            Self::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Self::BigNumber(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip_and_reject_unknown() {
        for ty in [
            ValueType::Number,
            ValueType::String,
            ValueType::Date,
            ValueType::Boolean,
            ValueType::Integer,
            ValueType::BigNumber,
            ValueType::Binary,
        ] {
            assert_eq!(ValueType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(ValueType::from_tag(0), None);
        assert_eq!(ValueType::from_tag(7), None);
        assert_eq!(ValueType::from_tag(0x0422_4D18), None);
    }

    #[test]
    fn null_fits_every_type() {
        assert!(Value::Null.fits(ValueType::Date));
        assert!(Value::Integer(1).fits(ValueType::Integer));
        assert!(!Value::Integer(1).fits(ValueType::String));
    }

    #[test]
    fn value_serde_is_tagged() {
        let json = serde_json::to_string(&Value::Integer(7)).unwrap();
        assert_eq!(json, r#"{"type":"integer","value":7}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Integer(7));
    }
}
