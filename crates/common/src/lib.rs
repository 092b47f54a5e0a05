//! Shared model for the JIDL data logging engine: logical data types and
//! values, the configuration grammar, and the error taxonomy every other
//! crate builds on.

pub mod config;
pub mod crypto;
pub mod data_type;
pub mod errors;
pub mod ini;
pub mod qualifier;
pub mod shutdown;
pub mod value;

pub use data_type::{
    DataType,
    SqlType,
};
pub use errors::{
    ErrorCode,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
pub use qualifier::Qualifier;
pub use value::TagValue;

/// Validates a tag or connection identifier: `^[A-Za-z_][A-Za-z0-9_]*$`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::is_valid_identifier;

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("x"));
        assert!(is_valid_identifier("_tank2_level"));
        assert!(is_valid_identifier("Flow_01"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2tank"));
        assert!(!is_valid_identifier("tank level"));
        assert!(!is_valid_identifier("tank-level"));
    }
}
