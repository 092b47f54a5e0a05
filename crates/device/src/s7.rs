//! S7 typed tag identifiers. Address validity is the transport's business;
//! this layer only forms the `"<address>:<code>"` identifier the transport
//! understands.

use common::data_type::DataType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S7Tag {
    id: String,
}

impl S7Tag {
    pub fn new(address: &str, data_type: DataType) -> Self {
        Self {
            id: format!("{}:{}", address.trim(), data_type.s7_code()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use common::data_type::DataType;

    use super::S7Tag;

    #[test]
    fn test_tag_identifiers() {
        assert_eq!(S7Tag::new("DB1.DBX0.0", DataType::Boolean).id(), "DB1.DBX0.0:BOOL");
        assert_eq!(S7Tag::new("DB1.DBW2", DataType::Integer).id(), "DB1.DBW2:INT");
        assert_eq!(S7Tag::new("DB1.DBD4", DataType::Real).id(), "DB1.DBD4:REAL");
        assert_eq!(
            S7Tag::new("DB2.DBB0", DataType::Text { size: Some(32) }).id(),
            "DB2.DBB0:STRING(32)"
        );
        // Oversized strings clamp to the S7 maximum.
        assert_eq!(
            S7Tag::new("DB2.DBB0", DataType::Text { size: Some(999) }).id(),
            "DB2.DBB0:STRING(254)"
        );
    }
}
