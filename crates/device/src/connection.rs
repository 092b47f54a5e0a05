//! A stateful binding to one device: its client, its ordered readers and
//! writers, and the connection state machine the scheduler drives.

use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    config::{
        ConnectionConfig,
        ConnectionKind,
    },
    errors::ErrorMetadata,
    qualifier::Qualifier,
    value::TagValue,
};

use crate::{
    modbus::ModbusAddress,
    s7::S7Tag,
    Address,
    Reader,
    SharedClient,
    Variable,
    Writer,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connected,
}

pub struct Connection {
    name: String,
    kind: ConnectionKind,
    sample_ticks: u32,
    status: Status,
    last_timestamp: Option<DateTime<Utc>>,
    readers: Vec<Reader>,
    writers: Vec<Writer>,
    client: SharedClient,
}

impl Connection {
    /// Builds the connection from its configuration, binding each reader
    /// and writer address in the protocol's own grammar.
    pub fn new(config: &ConnectionConfig, client: SharedClient) -> anyhow::Result<Self> {
        let mut readers = Vec::with_capacity(config.readers.len());
        for reader in &config.readers {
            let variable = Variable::new(&reader.name, reader.data_type)?;
            let address = bind_address(&config.kind, &reader.address, &variable)?;
            readers.push(Reader::new(variable, address));
        }
        let mut writers = Vec::with_capacity(config.writers.len());
        if !config.writers.is_empty() && !kind_writeable(&config.kind) {
            anyhow::bail!(ErrorMetadata::config_invalid(
                "NotWriteable",
                format!("Connection {:?} does not support writers", config.name),
            ));
        }
        for writer in &config.writers {
            let variable = Variable::new(&writer.name, writer.data_type)?;
            let address = bind_address(&config.kind, &writer.address, &variable)?;
            writers.push(Writer::new(
                variable,
                address,
                &*writer.source_var,
                &*writer.source_connection,
            ));
        }
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind.clone(),
            sample_ticks: config.sample_ticks,
            status: Status::Disconnected,
            last_timestamp: None,
            readers,
            writers,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ConnectionKind {
        &self.kind
    }

    pub fn sample_ticks(&self) -> u32 {
        self.sample_ticks
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn readers(&self) -> &[Reader] {
        &self.readers
    }

    pub fn writers(&self) -> &[Writer] {
        &self.writers
    }

    pub fn client(&self) -> SharedClient {
        self.client.clone()
    }

    /// Whether a read is due at logical counter `c` (in deciseconds).
    pub fn is_due(&self, counter: u64) -> bool {
        counter % self.sample_ticks as u64 == 0
    }

    pub fn is_writeable(&self) -> bool {
        kind_writeable(&self.kind) && !self.writers.is_empty()
    }

    /// Walks the state machine up to CONNECTED and reads every tag. On
    /// success the cached values are refreshed and the sample timestamp
    /// advanced.
    pub async fn read(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let client = self.client.clone();
        let mut client = client.lock().await;
        if !client.is_initialized() {
            client.initialize().await.map_err(|e| {
                e.context(ErrorMetadata::device_unreachable(
                    "InitializeFailed",
                    format!("Connection {:?} failed to initialize", self.name),
                ))
            })?;
        }
        if self.status == Status::Disconnected {
            client.connect().await.map_err(|e| {
                e.context(ErrorMetadata::device_unreachable(
                    "ConnectFailed",
                    format!("Connection {:?} failed to connect", self.name),
                ))
            })?;
            self.status = Status::Connected;
        }
        client.read(&mut self.readers).await?;
        self.last_timestamp = Some(now);
        Ok(())
    }

    /// Pushes the writers' current values out.
    pub async fn write(&mut self) -> anyhow::Result<()> {
        let client = self.client.clone();
        let mut client = client.lock().await;
        client.write(&mut self.writers).await
    }

    /// Marks the connection disconnected and releases the client's link.
    /// Failures on the way down are ignored; the next due tick reconnects.
    pub async fn disconnect(&mut self) {
        self.status = Status::Disconnected;
        let client = self.client.clone();
        let mut client = client.lock().await;
        if let Err(e) = client.disconnect().await {
            tracing::debug!("Disconnect of {:?} failed: {e:#}", self.name);
        }
    }

    /// Text values of every reader holding a value, keyed by tag name. The
    /// row the sink receives is this map plus `TIMESTAMP`.
    pub fn all_data_as_text(&self) -> BTreeMap<String, String> {
        self.readers
            .iter()
            .filter_map(|r| Some((r.variable.name().to_owned(), r.variable.value_as_text()?)))
            .collect()
    }

    /// Most recent cached value of one reader.
    pub fn cached_value(&self, var: &str) -> Option<TagValue> {
        self.readers
            .iter()
            .find(|r| r.variable.name() == var)
            .and_then(|r| r.variable.value().cloned())
    }

    /// Feeds a writer from its bound source value.
    pub fn set_writer_value(&mut self, var: &str, value: TagValue) {
        if let Some(writer) = self.writers.iter_mut().find(|w| w.variable.name() == var) {
            writer.variable.set_value(value);
        }
    }

    /// The `(label, value)` view of the connection's parameters.
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        match &self.kind {
            ConnectionKind::S7 { address, rack, slot } => vec![
                ("address", address.clone()),
                ("rack", rack.to_string()),
                ("slot", slot.to_string()),
            ],
            ConnectionKind::ModbusTcp {
                address,
                port,
                reversed,
            } => vec![
                ("address", address.clone()),
                ("port", port.to_string()),
                ("reversed", reversed.to_string()),
            ],
            ConnectionKind::OpcUa {
                address,
                port,
                path,
                discovery,
                username,
                ..
            } => vec![
                ("address", address.clone()),
                ("port", port.to_string()),
                ("path", path.clone()),
                ("discovery", discovery.to_string()),
                ("username", username.clone().unwrap_or_default()),
            ],
            ConnectionKind::Json { address } => vec![("address", address.clone())],
            ConnectionKind::Ipc { address, port } => vec![
                ("address", address.clone()),
                ("port", port.to_string()),
            ],
        }
    }
}

fn kind_writeable(kind: &ConnectionKind) -> bool {
    matches!(
        kind,
        ConnectionKind::S7 { .. } | ConnectionKind::ModbusTcp { .. } | ConnectionKind::OpcUa { .. }
    )
}

fn bind_address(
    kind: &ConnectionKind,
    address: &str,
    variable: &Variable,
) -> anyhow::Result<Address> {
    let address = match kind {
        ConnectionKind::ModbusTcp { reversed, .. } => Address::Modbus(ModbusAddress::parse(
            address,
            variable.data_type(),
            *reversed,
        )?),
        ConnectionKind::S7 { .. } => Address::S7(S7Tag::new(address, variable.data_type())),
        ConnectionKind::OpcUa { .. } => Address::OpcUa(address.to_owned()),
        ConnectionKind::Json { .. } => Address::Json(address.to_owned()),
        ConnectionKind::Ipc { .. } => {
            let qualifier: Qualifier = address.parse()?;
            anyhow::ensure!(
                matches!(qualifier, Qualifier::Reader { .. }),
                ErrorMetadata::bad_argument(
                    "BadRemoteAddress",
                    format!("IPC tag address {address:?} must be var::connection"),
                )
            );
            Address::Ipc(qualifier)
        },
    };
    Ok(address)
}
