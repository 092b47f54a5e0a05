//! Typed tag values and their conversions to the three representations the
//! engine needs: SQL insert text, IPC JSON, and device-payload coercion.

use std::fmt;

use serde_json::Value as JsonValue;

use crate::{
    data_type::DataType,
    errors::ErrorMetadata,
};

/// A value read from or written to a device tag. The storage class is a
/// function of the tag's [`DataType`]: every integral kind collapses to
/// `Int`, both floating kinds to `Float`.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// The zero value writers start from before their first write.
    pub fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => TagValue::Bool(false),
            DataType::Integer
            | DataType::DoubleInteger
            | DataType::Byte
            | DataType::Word
            | DataType::DoubleWord => TagValue::Int(0),
            DataType::Float | DataType::Real => TagValue::Float(0.0),
            DataType::Text { .. } => TagValue::Text(String::new()),
        }
    }

    /// Canonical text for SQL inserts. Booleans become `1`/`0` to suit their
    /// NUMERIC column type.
    pub fn as_text(&self) -> String {
        match self {
            TagValue::Bool(true) => "1".to_owned(),
            TagValue::Bool(false) => "0".to_owned(),
            TagValue::Int(i) => i.to_string(),
            TagValue::Float(x) => x.to_string(),
            TagValue::Text(s) => s.clone(),
        }
    }

    /// Typed JSON for IPC `values` responses.
    pub fn to_json(&self) -> JsonValue {
        match self {
            TagValue::Bool(b) => JsonValue::Bool(*b),
            TagValue::Int(i) => JsonValue::from(*i),
            TagValue::Float(x) => JsonValue::from(*x),
            TagValue::Text(s) => JsonValue::from(s.clone()),
        }
    }

    /// Coerces a decoded JSON field into the target type. Used by the
    /// JSON/HTTP device client and the IPC-as-client connection.
    pub fn from_json(data_type: DataType, value: &JsonValue) -> anyhow::Result<Self> {
        let mismatch = || {
            ErrorMetadata::decode_error(
                "TypeMismatch",
                format!("Cannot decode {value} as {data_type}"),
            )
        };
        let v = match data_type {
            DataType::Boolean => match value {
                JsonValue::Bool(b) => TagValue::Bool(*b),
                JsonValue::Number(n) => TagValue::Bool(n.as_f64() != Some(0.0)),
                _ => anyhow::bail!(mismatch()),
            },
            DataType::Integer
            | DataType::DoubleInteger
            | DataType::Byte
            | DataType::Word
            | DataType::DoubleWord => match value {
                JsonValue::Number(n) => {
                    let i = n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|x| x as i64))
                        .ok_or_else(mismatch)?;
                    TagValue::Int(i)
                },
                JsonValue::String(s) => {
                    TagValue::Int(s.trim().parse().map_err(|_| mismatch())?)
                },
                _ => anyhow::bail!(mismatch()),
            },
            DataType::Float | DataType::Real => match value {
                JsonValue::Number(n) => TagValue::Float(n.as_f64().ok_or_else(mismatch)?),
                JsonValue::String(s) => {
                    TagValue::Float(s.trim().parse().map_err(|_| mismatch())?)
                },
                _ => anyhow::bail!(mismatch()),
            },
            DataType::Text { .. } => match value {
                JsonValue::String(s) => TagValue::Text(s.clone()),
                JsonValue::Number(n) => TagValue::Text(n.to_string()),
                JsonValue::Bool(b) => TagValue::Text(b.to_string()),
                _ => anyhow::bail!(mismatch()),
            },
        };
        Ok(v)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_insert_text() {
        assert_eq!(TagValue::Bool(true).as_text(), "1");
        assert_eq!(TagValue::Bool(false).as_text(), "0");
        assert_eq!(TagValue::Int(-7).as_text(), "-7");
        assert_eq!(TagValue::Float(1.5).as_text(), "1.5");
        assert_eq!(TagValue::Text("hello!".to_owned()).as_text(), "hello!");
    }

    #[test]
    fn test_json_coercion() {
        assert_eq!(
            TagValue::from_json(DataType::Integer, &json!(42)).unwrap(),
            TagValue::Int(42)
        );
        assert_eq!(
            TagValue::from_json(DataType::Integer, &json!("17")).unwrap(),
            TagValue::Int(17)
        );
        assert_eq!(
            TagValue::from_json(DataType::Real, &json!(127.2)).unwrap(),
            TagValue::Float(127.2)
        );
        assert_eq!(
            TagValue::from_json(DataType::Boolean, &json!(1)).unwrap(),
            TagValue::Bool(true)
        );
        assert_eq!(
            TagValue::from_json(DataType::Text { size: None }, &json!("hello!")).unwrap(),
            TagValue::Text("hello!".to_owned())
        );
        assert!(TagValue::from_json(DataType::Integer, &json!({"a": 1})).is_err());
        assert!(TagValue::from_json(DataType::Boolean, &json!("yes")).is_err());
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(TagValue::zero(DataType::Boolean), TagValue::Bool(false));
        assert_eq!(TagValue::zero(DataType::DoubleWord), TagValue::Int(0));
        assert_eq!(TagValue::zero(DataType::Float), TagValue::Float(0.0));
    }
}
