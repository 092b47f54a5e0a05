//! The closed set of logical value kinds used at both the protocol and SQL
//! layers. A tag's type is chosen at configuration time and never changes.

use std::fmt;

use anyhow::Context;

use crate::errors::ErrorMetadata;

/// Default register count for Modbus `TEXT` tags without an explicit size.
pub const DEFAULT_TEXT_SIZE: u16 = 127;

/// Maximum (and default) length of an S7 `STRING(n)` tag.
pub const MAX_S7_STRING_LEN: u16 = 254;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Integer,
    DoubleInteger,
    Float,
    Real,
    Byte,
    Word,
    DoubleWord,
    /// Carries an optional positive size (registers for Modbus, characters
    /// for S7 strings).
    Text {
        size: Option<u16>,
    },
}

/// Canonical SQL column type for sink column declarations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlType {
    Numeric,
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Numeric => "NUMERIC",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

impl DataType {
    pub fn sql_type(&self) -> SqlType {
        match self {
            DataType::Boolean => SqlType::Numeric,
            DataType::Integer
            | DataType::DoubleInteger
            | DataType::Byte
            | DataType::Word
            | DataType::DoubleWord => SqlType::Integer,
            DataType::Float | DataType::Real => SqlType::Real,
            DataType::Text { .. } => SqlType::Text,
        }
    }

    /// S7 type code used to form the `"<address>:<code>"` tag identifier.
    pub fn s7_code(&self) -> String {
        match self {
            DataType::Boolean => "BOOL".to_owned(),
            DataType::Byte => "BYTE".to_owned(),
            DataType::Integer => "INT".to_owned(),
            DataType::Word => "WORD".to_owned(),
            DataType::DoubleInteger | DataType::DoubleWord => "DINT".to_owned(),
            DataType::Float | DataType::Real => "REAL".to_owned(),
            DataType::Text { size } => {
                let n = size
                    .unwrap_or(MAX_S7_STRING_LEN)
                    .min(MAX_S7_STRING_LEN);
                format!("STRING({n})")
            },
        }
    }

    /// Register footprint on Modbus register space. Bit-space types have no
    /// register footprint.
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Boolean => 0,
            DataType::Integer | DataType::Byte | DataType::Word => 1,
            DataType::DoubleInteger
            | DataType::DoubleWord
            | DataType::Float
            | DataType::Real => 2,
            DataType::Text { size } => size.unwrap_or(DEFAULT_TEXT_SIZE),
        }
    }

    /// Parses a configuration `type` value: a `DataType` name with an
    /// optional `(size)` suffix on `TEXT`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("TEXT") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Ok(DataType::Text { size: None });
            }
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .with_context(|| {
                    ErrorMetadata::config_invalid(
                        "BadDataType",
                        format!("Malformed TEXT size in {s:?}"),
                    )
                })?;
            let size: u16 = inner.trim().parse().with_context(|| {
                ErrorMetadata::config_invalid(
                    "BadDataType",
                    format!("Bad TEXT size in {s:?}"),
                )
            })?;
            anyhow::ensure!(
                size > 0,
                ErrorMetadata::config_invalid("BadDataType", "TEXT size must be positive")
            );
            return Ok(DataType::Text { size: Some(size) });
        }
        match s {
            "BOOLEAN" => Ok(DataType::Boolean),
            "INTEGER" => Ok(DataType::Integer),
            "DOUBLE_INTEGER" => Ok(DataType::DoubleInteger),
            "FLOAT" => Ok(DataType::Float),
            "REAL" => Ok(DataType::Real),
            "BYTE" => Ok(DataType::Byte),
            "WORD" => Ok(DataType::Word),
            "DOUBLE_WORD" => Ok(DataType::DoubleWord),
            _ => anyhow::bail!(ErrorMetadata::config_invalid(
                "BadDataType",
                format!("Unknown data type {s:?}"),
            )),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::DoubleInteger => write!(f, "DOUBLE_INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Real => write!(f, "REAL"),
            DataType::Byte => write!(f, "BYTE"),
            DataType::Word => write!(f, "WORD"),
            DataType::DoubleWord => write!(f, "DOUBLE_WORD"),
            DataType::Text { size: None } => write!(f, "TEXT"),
            DataType::Text { size: Some(n) } => write!(f, "TEXT({n})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for s in [
            "BOOLEAN",
            "INTEGER",
            "DOUBLE_INTEGER",
            "FLOAT",
            "REAL",
            "BYTE",
            "WORD",
            "DOUBLE_WORD",
            "TEXT",
            "TEXT(40)",
        ] {
            let dt = DataType::parse(s).unwrap();
            assert_eq!(dt.to_string(), s);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DataType::parse("STRING").is_err());
        assert!(DataType::parse("TEXT()").is_err());
        assert!(DataType::parse("TEXT(0)").is_err());
        assert!(DataType::parse("TEXT(forty)").is_err());
        assert!(DataType::parse("").is_err());
    }

    #[test]
    fn test_sql_type_map() {
        assert_eq!(DataType::Boolean.sql_type(), SqlType::Numeric);
        assert_eq!(DataType::Word.sql_type(), SqlType::Integer);
        assert_eq!(DataType::Real.sql_type(), SqlType::Real);
        assert_eq!(
            DataType::Text { size: Some(12) }.sql_type(),
            SqlType::Text
        );
    }

    #[test]
    fn test_s7_codes() {
        assert_eq!(DataType::Boolean.s7_code(), "BOOL");
        assert_eq!(DataType::DoubleInteger.s7_code(), "DINT");
        assert_eq!(DataType::Text { size: None }.s7_code(), "STRING(254)");
        assert_eq!(
            DataType::Text { size: Some(400) }.s7_code(),
            "STRING(254)"
        );
    }
}
