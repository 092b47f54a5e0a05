//! Generic client for tag-addressed protocol stacks (S7, OPC UA). The
//! stack itself lives behind [`TagTransport`]; this client only walks the
//! reader/writer lists and coerces values.

use async_trait::async_trait;
use common::{
    errors::ErrorMetadata,
    value::TagValue,
};
use serde_json::Value as JsonValue;

use crate::{
    Address,
    DeviceClient,
    Reader,
    Writer,
};

/// A protocol stack that reads and writes values by string tag identifier.
/// Tag validity is the stack's business.
#[async_trait]
pub trait TagTransport: Send + 'static {
    async fn initialize(&mut self) -> anyhow::Result<()>;

    async fn connect(&mut self) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;

    fn is_initialized(&self) -> bool;

    /// Reads the given tags, one value per tag in order.
    async fn read_tags(&mut self, tags: &[String]) -> anyhow::Result<Vec<JsonValue>>;

    async fn write_tag(&mut self, tag: &str, value: &TagValue) -> anyhow::Result<()>;
}

pub struct TagClient {
    transport: Box<dyn TagTransport>,
}

impl TagClient {
    pub fn new(transport: Box<dyn TagTransport>) -> Self {
        Self { transport }
    }
}

fn tag_id(address: &Address, name: &str) -> anyhow::Result<String> {
    match address {
        Address::S7(tag) => Ok(tag.id().to_owned()),
        Address::OpcUa(node) => Ok(node.clone()),
        other => anyhow::bail!(ErrorMetadata::bad_argument(
            "AddressKindMismatch",
            format!("Tag {name:?} has non-tag address {other:?}"),
        )),
    }
}

#[async_trait]
impl DeviceClient for TagClient {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.transport.initialize().await
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.transport.connect().await
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.transport.disconnect().await
    }

    fn is_initialized(&self) -> bool {
        self.transport.is_initialized()
    }

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()> {
        let tags = readers
            .iter()
            .map(|r| tag_id(&r.address, r.variable.name()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let values = self.transport.read_tags(&tags).await?;
        anyhow::ensure!(
            values.len() == readers.len(),
            ErrorMetadata::device_read_error(
                "ShortRead",
                format!("Expected {} values, got {}", readers.len(), values.len()),
            )
        );
        for (reader, value) in readers.iter_mut().zip(values) {
            match TagValue::from_json(reader.variable.data_type(), &value) {
                Ok(value) => reader.variable.set_value(value),
                Err(e) => {
                    tracing::warn!("Decode failed for {}: {e:#}", reader.variable.name());
                },
            }
        }
        Ok(())
    }

    async fn write(&mut self, writers: &mut [Writer]) -> anyhow::Result<()> {
        for writer in writers {
            let tag = tag_id(&writer.address, writer.variable.name())?;
            let Some(value) = writer.variable.value().cloned() else {
                continue;
            };
            self.transport.write_tag(&tag, &value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::data_type::DataType;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        s7::S7Tag,
        Variable,
    };

    #[derive(Clone, Default)]
    struct FakeTransport {
        reads: Arc<Mutex<Vec<Vec<String>>>>,
        writes: Arc<Mutex<Vec<(String, TagValue)>>>,
    }

    #[async_trait]
    impl TagTransport for FakeTransport {
        async fn initialize(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn connect(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            true
        }

        async fn read_tags(&mut self, tags: &[String]) -> anyhow::Result<Vec<JsonValue>> {
            self.reads.lock().push(tags.to_vec());
            Ok(tags.iter().map(|_| json!(21)).collect())
        }

        async fn write_tag(&mut self, tag: &str, value: &TagValue) -> anyhow::Result<()> {
            self.writes.lock().push((tag.to_owned(), value.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_forms_typed_tag_ids() -> anyhow::Result<()> {
        let transport = FakeTransport::default();
        let mut client = TagClient::new(Box::new(transport.clone()));
        let mut readers = vec![
            Reader::new(
                Variable::new("level", DataType::Real)?,
                Address::S7(S7Tag::new("DB1.DBD4", DataType::Real)),
            ),
            Reader::new(
                Variable::new("mode", DataType::Integer)?,
                Address::OpcUa("ns=2;s=Mode".to_owned()),
            ),
        ];
        client.read(&mut readers).await?;
        assert_eq!(
            transport.reads.lock()[0],
            vec!["DB1.DBD4:REAL".to_owned(), "ns=2;s=Mode".to_owned()]
        );
        assert_eq!(readers[0].variable.value(), Some(&TagValue::Float(21.0)));
        assert_eq!(readers[1].variable.value(), Some(&TagValue::Int(21)));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_pushes_bound_values() -> anyhow::Result<()> {
        let transport = FakeTransport::default();
        let mut client = TagClient::new(Box::new(transport.clone()));
        let mut writers = vec![Writer::new(
            Variable::new("setpoint", DataType::Integer)?,
            Address::S7(S7Tag::new("DB1.DBW2", DataType::Integer)),
            "level",
            "other",
        )];
        writers[0].variable.set_value(TagValue::Int(55));
        client.write(&mut writers).await?;
        assert_eq!(
            transport.writes.lock()[0],
            ("DB1.DBW2:INT".to_owned(), TagValue::Int(55))
        );
        Ok(())
    }
}
