//! JSON/HTTP device client: one GET per read, each tag address naming a key
//! in the decoded object.

use std::time::Duration;

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

const REQUEST_DEADLINE: Duration = Duration::from_secs(3);

pub struct JsonHttpClient {
    url: String,
    client: Option<reqwest::Client>,
}

impl JsonHttpClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: None,
        }
    }
}

#[async_trait]
impl DeviceClient for JsonHttpClient {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        if self.client.is_none() {
            let client = reqwest::Client::builder()
                .timeout(REQUEST_DEADLINE)
                .build()?;
            self.client = Some(client);
        }
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        // HTTP is connectionless here; the pool connects on first use.
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.client.is_some()
    }

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()> {
        let client = self.client.as_ref().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::device_unreachable(
                "NotInitialized",
                "JSON client is not initialized",
            ))
        })?;
        let body: JsonValue = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                anyhow::Error::from(e).context(ErrorMetadata::device_read_error(
                    "HttpRequestFailed",
                    format!("GET {} failed", self.url),
                ))
            })?
            .error_for_status()
            .map_err(|e| {
                anyhow::Error::from(e).context(ErrorMetadata::device_read_error(
                    "HttpStatus",
                    format!("GET {} returned an error status", self.url),
                ))
            })?
            .json()
            .await
            .map_err(|e| {
                anyhow::Error::from(e).context(ErrorMetadata::device_read_error(
                    "BadJsonBody",
                    format!("GET {} did not return JSON", self.url),
                ))
            })?;
        for reader in readers {
            let Address::Json(ref key) = reader.address else {
                anyhow::bail!(ErrorMetadata::bad_argument(
                    "AddressKindMismatch",
                    format!("Tag {:?} has a non-JSON address", reader.variable.name()),
                ));
            };
            match body.get(key) {
                Some(field) => {
                    match TagValue::from_json(reader.variable.data_type(), field) {
                        Ok(value) => reader.variable.set_value(value),
                        Err(e) => {
                            tracing::warn!("Decode failed for {key:?}: {e:#}");
                        },
                    }
                },
                None => tracing::warn!("Key {key:?} missing from {}", self.url),
            }
        }
        Ok(())
    }

    async fn write(&mut self, _writers: &mut [Writer]) -> anyhow::Result<()> {
        anyhow::bail!(ErrorMetadata::device_write_error(
            "NotWriteable",
            "JSON connections are read-only",
        ))
    }
}
