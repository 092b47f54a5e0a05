//! Configuration section identifiers.
//!
//! Three forms exist: a bare connection name, `var::connection` for a
//! reader, and `var::connection<-srcVar::srcConnection` for a writer bound
//! to a reader source. Parsing is strict; ambiguous IDs are rejected.

use std::{
    fmt,
    str::FromStr,
};

use crate::errors::ErrorMetadata;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Connection {
        name: String,
    },
    Reader {
        var: String,
        connection: String,
    },
    Writer {
        var: String,
        connection: String,
        source_var: String,
        source_connection: String,
    },
}

fn bad(id: &str) -> ErrorMetadata {
    ErrorMetadata::bad_argument("BadQualifier", format!("Ambiguous qualifier {id:?}"))
}

/// Splits a strict `var::connection` pair: exactly one `::`, both sides
/// non-empty and free of further separators.
fn split_pair(s: &str, id: &str) -> anyhow::Result<(String, String)> {
    let Some((var, connection)) = s.split_once("::") else {
        anyhow::bail!(bad(id));
    };
    if var.is_empty()
        || connection.is_empty()
        || connection.contains("::")
        || var.contains("<-")
        || connection.contains("<-")
    {
        anyhow::bail!(bad(id));
    }
    Ok((var.to_owned(), connection.to_owned()))
}

impl FromStr for Qualifier {
    type Err = anyhow::Error;

    fn from_str(id: &str) -> anyhow::Result<Self> {
        if let Some((dest, source)) = id.split_once("<-") {
            let (var, connection) = split_pair(dest, id)?;
            let (source_var, source_connection) = split_pair(source, id)?;
            return Ok(Qualifier::Writer {
                var,
                connection,
                source_var,
                source_connection,
            });
        }
        if id.contains("::") {
            let (var, connection) = split_pair(id, id)?;
            return Ok(Qualifier::Reader { var, connection });
        }
        if id.is_empty() {
            anyhow::bail!(bad(id));
        }
        Ok(Qualifier::Connection { name: id.to_owned() })
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Connection { name } => write!(f, "{name}"),
            Qualifier::Reader { var, connection } => write!(f, "{var}::{connection}"),
            Qualifier::Writer {
                var,
                connection,
                source_var,
                source_connection,
            } => write!(f, "{var}::{connection}<-{source_var}::{source_connection}"),
        }
    }
}

/// The `var::connection` key used for cached-value lookups and IPC
/// responses.
pub fn value_key(var: &str, connection: &str) -> String {
    format!("{var}::{connection}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            "plc1".parse::<Qualifier>().unwrap(),
            Qualifier::Connection {
                name: "plc1".to_owned()
            }
        );
        assert_eq!(
            "level::plc1".parse::<Qualifier>().unwrap(),
            Qualifier::Reader {
                var: "level".to_owned(),
                connection: "plc1".to_owned()
            }
        );
        assert_eq!(
            "setpoint::plc2<-level::plc1".parse::<Qualifier>().unwrap(),
            Qualifier::Writer {
                var: "setpoint".to_owned(),
                connection: "plc2".to_owned(),
                source_var: "level".to_owned(),
                source_connection: "plc1".to_owned(),
            }
        );
    }

    #[test]
    fn test_round_trip() {
        for id in ["plc1", "level::plc1", "a::b<-c::d"] {
            assert_eq!(id.parse::<Qualifier>().unwrap().to_string(), id);
        }
    }

    #[test]
    fn test_rejects_ambiguous() {
        for id in [
            "",
            "::",
            "a::",
            "::b",
            "a::b::c",
            "a<-b",
            "a::b<-c",
            "a::b<-c::d<-e::f",
            "a::b::c<-d::e",
        ] {
            assert!(id.parse::<Qualifier>().is_err(), "accepted {id:?}");
        }
    }
}
