//! IPC-as-client: a connection that polls another logger over the framed
//! protocol. Tag addresses are `var::connection` qualifiers the remote
//! server resolves.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{
    errors::ErrorMetadata,
    qualifier::Qualifier,
    value::TagValue,
};
use ipc::{
    JidlClient,
    Request,
    Response,
};
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::{
    Address,
    DeviceClient,
    Reader,
    Writer,
};

const REQUEST_TIMEOUT_MS: u64 = 3_000;

pub struct IpcDeviceClient {
    client: JidlClient,
    initialized: bool,
}

impl IpcDeviceClient {
    pub fn new(client: JidlClient) -> Self {
        Self {
            client,
            initialized: false,
        }
    }
}

fn remote_qualifier<'a>(address: &'a Address, name: &str) -> anyhow::Result<&'a Qualifier> {
    match address {
        Address::Ipc(qualifier @ Qualifier::Reader { .. }) => Ok(qualifier),
        other => anyhow::bail!(ErrorMetadata::bad_argument(
            "AddressKindMismatch",
            format!("Tag {name:?} needs a var::connection address, has {other:?}"),
        )),
    }
}

#[async_trait]
impl DeviceClient for IpcDeviceClient {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        // The protocol opens one connection per request.
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()> {
        // Group the remote variables per remote connection, the shape the
        // `values` method takes.
        let mut wanted: BTreeMap<String, Vec<JsonValue>> = BTreeMap::new();
        for reader in readers.iter() {
            let Qualifier::Reader { var, connection } =
                remote_qualifier(&reader.address, reader.variable.name())?
            else {
                unreachable!("remote_qualifier only returns reader qualifiers");
            };
            wanted
                .entry(connection.clone())
                .or_default()
                .push(JsonValue::from(var.clone()));
        }
        let request = Request::with_payload("values", json!(wanted));
        let response = self
            .client
            .request(&request, REQUEST_TIMEOUT_MS)
            .await
            .map_err(|e| {
                e.context(ErrorMetadata::device_read_error(
                    "RemoteValuesFailed",
                    "values request to the remote logger failed",
                ))
            })?;
        let Response::OkWithPayload(payload) = response else {
            anyhow::bail!(ErrorMetadata::device_read_error(
                "RemoteValuesEmpty",
                "remote logger returned no payload",
            ));
        };
        for reader in readers {
            let qualifier = remote_qualifier(&reader.address, reader.variable.name())?;
            match payload.get(qualifier.to_string()) {
                Some(value) => {
                    match TagValue::from_json(reader.variable.data_type(), value) {
                        Ok(value) => reader.variable.set_value(value),
                        Err(e) => {
                            tracing::warn!(
                                "Decode failed for {}: {e:#}",
                                reader.variable.name()
                            );
                        },
                    }
                },
                None => tracing::warn!("Remote logger did not return {qualifier}"),
            }
        }
        Ok(())
    }

    async fn write(&mut self, _writers: &mut [Writer]) -> anyhow::Result<()> {
        anyhow::bail!(ErrorMetadata::device_write_error(
            "NotWriteable",
            "IPC connections are read-only",
        ))
    }
}
