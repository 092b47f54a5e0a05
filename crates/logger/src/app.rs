//! Builds the live engine out of a structured configuration and owns its
//! lifecycle. The CLI holds one `App`; nothing here is process-global.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    config::{
        ConnectionConfig,
        ConnectionKind,
        IpcConfig,
        JidlConfig,
        SinkConfig,
        SinkKind,
    },
    errors::ErrorMetadata,
    shutdown::ShutdownSignal,
};
use device::{
    json::JsonHttpClient,
    modbus::ModbusClient,
    Connection,
    DeviceClient,
    IpcDeviceClient,
    SharedClient,
};
use ipc::{
    tls,
    JidlClient,
    JidlServer,
};
use mariadb::{
    mariadb_sink,
    MariaDbOptions,
};
use sink::{
    DummySink,
    SqlSink,
};
use sqlite::sqlite_sink;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    archiver::Archiver,
    handler::LoggerRequestHandler,
    scheduler::DataLogger,
};

/// Builds one [`DeviceClient`] per connection. The default factory wires
/// the in-tree stacks; tests substitute scripted clients.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        config: &ConnectionConfig,
        ipc: Option<&IpcConfig>,
    ) -> anyhow::Result<Box<dyn DeviceClient>>;
}

pub struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn build(
        &self,
        config: &ConnectionConfig,
        ipc: Option<&IpcConfig>,
    ) -> anyhow::Result<Box<dyn DeviceClient>> {
        let client: Box<dyn DeviceClient> = match &config.kind {
            ConnectionKind::ModbusTcp { address, port, .. } => {
                Box::new(ModbusClient::tcp(address.clone(), *port))
            },
            ConnectionKind::Json { address } => Box::new(JsonHttpClient::new(address.clone())),
            ConnectionKind::Ipc { address, port } => {
                let ipc = ipc.ok_or_else(|| {
                    anyhow::anyhow!(ErrorMetadata::config_invalid(
                        "MissingIpcMaterial",
                        format!(
                            "Connection {:?} needs the global ipc_keystore/ipc_truststore",
                            config.name
                        ),
                    ))
                })?;
                let tls = tls::client_config(&ipc.keystore, &ipc.truststore)?;
                Box::new(IpcDeviceClient::new(JidlClient::new(
                    address.clone(),
                    *port,
                    tls,
                )))
            },
            ConnectionKind::S7 { .. } | ConnectionKind::OpcUa { .. } => {
                // The typed-tag layer is in place but no S7/OPC UA stack is
                // linked into this build.
                anyhow::bail!(ErrorMetadata::config_invalid(
                    "NoClientStack",
                    format!(
                        "Connection {:?}: no {} client stack is linked",
                        config.name,
                        config.kind.label(),
                    ),
                ));
            },
        };
        Ok(client)
    }
}

pub struct App {
    logger: Arc<DataLogger>,
    archiver: Option<Archiver>,
    server: Option<JidlServer>,
    fatal: ShutdownSignal,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    pub async fn new(
        config: JidlConfig,
        fatal: ShutdownSignal,
        remote_control: bool,
    ) -> anyhow::Result<Self> {
        Self::with_factory(config, fatal, remote_control, &DefaultClientFactory).await
    }

    pub async fn with_factory(
        config: JidlConfig,
        fatal: ShutdownSignal,
        remote_control: bool,
        factory: &dyn ClientFactory,
    ) -> anyhow::Result<Self> {
        let sink = build_sink(&config.sink)?;
        sink.open().await?;

        // PLC-style connections with the same endpoint alias one client so
        // a single link serves them.
        let mut shared_clients: BTreeMap<String, SharedClient> = BTreeMap::new();
        let mut connections = Vec::with_capacity(config.connections.len());
        for connection_config in &config.connections {
            let client = match shareable_key(&connection_config.kind) {
                Some(key) => match shared_clients.get(&key) {
                    Some(client) => client.clone(),
                    None => {
                        let client =
                            shared_from(factory.build(connection_config, config.ipc.as_ref())?);
                        shared_clients.insert(key, client.clone());
                        client
                    },
                },
                None => shared_from(factory.build(connection_config, config.ipc.as_ref())?),
            };
            let connection = Connection::new(connection_config, client)?;
            let columns: Vec<_> = connection_config
                .readers
                .iter()
                .map(|r| (r.name.clone(), r.data_type.sql_type()))
                .collect();
            sink.create_data_table(&connection_config.name, &columns)
                .await?;
            connections.push(Arc::new(AsyncMutex::new(connection)));
        }
        sink.store_configuration(&config.sections).await?;

        let logger = Arc::new(DataLogger::new(
            config.sink.name.clone(),
            connections,
            sink.clone(),
        ));

        let archiver = match config.archiver {
            Some(schedule) if sink.is_archiver() => {
                let archiver = Archiver::new(sink.clone());
                archiver.set_archiving_service(
                    schedule.day,
                    schedule.interval,
                    schedule.monthly,
                )?;
                Some(archiver)
            },
            Some(_) => {
                tracing::warn!("Archiver configured but the sink does not support snapshots");
                None
            },
            None => None,
        };

        let server = match &config.ipc {
            Some(ipc_config) => {
                let tls = tls::server_config(&ipc_config.keystore, &ipc_config.truststore)?;
                let handler = Arc::new(LoggerRequestHandler::new(
                    logger.clone(),
                    fatal.clone(),
                    remote_control,
                ));
                Some(JidlServer::new(ipc_config.port, tls, handler))
            },
            None => None,
        };

        Ok(Self {
            logger,
            archiver,
            server,
            fatal,
        })
    }

    pub fn logger(&self) -> Arc<DataLogger> {
        self.logger.clone()
    }

    /// Starts the IPC server, if one is configured.
    pub async fn start_server(&self) -> anyhow::Result<()> {
        if let Some(server) = &self.server {
            server.start().await?;
        }
        Ok(())
    }

    pub async fn start_logging(&self) -> anyhow::Result<()> {
        self.logger.start(self.fatal.clone()).await
    }

    pub async fn stop_logging(&self) {
        self.logger.stop().await;
    }

    pub fn is_logging(&self) -> bool {
        self.logger.status()
    }

    /// Orderly teardown: logging, archiver, server.
    pub async fn shutdown(&self) {
        self.logger.stop().await;
        if let Some(archiver) = &self.archiver {
            archiver.stop().await;
        }
        if let Some(server) = &self.server {
            server.stop();
        }
    }
}

fn shared_from(client: Box<dyn DeviceClient>) -> SharedClient {
    Arc::new(tokio::sync::Mutex::new(client))
}

/// Endpoint identity for client aliasing; only the PLC-style kinds share.
fn shareable_key(kind: &ConnectionKind) -> Option<String> {
    match kind {
        ConnectionKind::S7 { .. }
        | ConnectionKind::ModbusTcp { .. }
        | ConnectionKind::OpcUa { .. } => Some(kind.share_key()),
        ConnectionKind::Json { .. } | ConnectionKind::Ipc { .. } => None,
    }
}

fn build_sink(config: &SinkConfig) -> anyhow::Result<Arc<dyn SqlSink>> {
    let sink: Arc<dyn SqlSink> = match config.kind {
        SinkKind::Dummy => Arc::new(DummySink::new()),
        SinkKind::Sqlite => Arc::new(sqlite_sink(&config.dir, &config.name)),
        SinkKind::MariaDb => {
            let server = config.server.clone().ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::config_invalid(
                    "MissingKey",
                    "[datalogger] type = mariadb needs a server",
                ))
            })?;
            Arc::new(mariadb_sink(MariaDbOptions {
                server,
                port: config.port.unwrap_or(3306),
                username: config.username.clone(),
                password: config.password.clone(),
                database: config.name.clone(),
            }))
        },
        SinkKind::MonetDb => {
            // The MonetDB dialect is implemented, but no MAPI driver is
            // available to back it.
            anyhow::bail!(ErrorMetadata::config_invalid(
                "NoMonetDbDriver",
                "[datalogger] type = monetdb: no MonetDB driver is linked",
            ));
        },
    };
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use common::ini;
    use device::testing::ScriptedClient;

    use super::*;

    struct ScriptedFactory;

    impl ClientFactory for ScriptedFactory {
        fn build(
            &self,
            _config: &ConnectionConfig,
            _ipc: Option<&IpcConfig>,
        ) -> anyhow::Result<Box<dyn DeviceClient>> {
            Ok(Box::new(ScriptedClient::new()))
        }
    }

    fn config(text: &str) -> JidlConfig {
        JidlConfig::from_sections(ini::parse(text).unwrap()).unwrap()
    }

    const BASIC: &str = "[datalogger]\ntype = dummy\nname = t\ndir = ./\n\n[c]\ntype = \
                         json\naddress = http://127.0.0.1:8080/json\nseconds = 1\n\n[x::c]\n\
                         address = foo\ntype = INTEGER\n";

    #[tokio::test]
    async fn test_app_builds_from_config() -> anyhow::Result<()> {
        let app = App::with_factory(
            config(BASIC),
            ShutdownSignal::no_op(),
            false,
            &ScriptedFactory,
        )
        .await?;
        assert!(!app.is_logging());
        let logger = app.logger();
        assert!(logger.connection("c").await.is_some());
        assert_eq!(
            logger.sink().headers("c"),
            Some(vec!["TIMESTAMP".to_owned(), "x".to_owned()])
        );
        // The configuration is persisted, one section per row.
        assert_eq!(logger.sink().get_configuration().await?.len(), 3);
        app.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_clients_alias_same_endpoint() -> anyhow::Result<()> {
        let text = "[datalogger]\ntype = dummy\nname = t\ndir = ./\n\n[a]\ntype = \
                    modbus-tcp\naddress = 10.0.0.2\nseconds = 1\n\n[b]\ntype = \
                    modbus-tcp\naddress = 10.0.0.2\nseconds = 2\n\n[c]\ntype = \
                    modbus-tcp\naddress = 10.0.0.3\nseconds = 1\n";
        let app = App::with_factory(
            config(text),
            ShutdownSignal::no_op(),
            false,
            &ScriptedFactory,
        )
        .await?;
        let logger = app.logger();
        let a = logger.connection("a").await.unwrap();
        let b = logger.connection("b").await.unwrap();
        let c = logger.connection("c").await.unwrap();
        let (a, b, c) = (a.lock().await, b.lock().await, c.lock().await);
        assert!(Arc::ptr_eq(&a.client(), &b.client()));
        assert!(!Arc::ptr_eq(&a.client(), &c.client()));
        Ok(())
    }

    #[tokio::test]
    async fn test_monetdb_is_rejected() {
        let sections =
            ini::parse("[datalogger]\ntype = monetdb\nname = t\ndir = ./\n").unwrap();
        let config = JidlConfig::from_sections(sections).unwrap();
        let err = App::new(config, ShutdownSignal::no_op(), false)
            .await
            .unwrap_err();
        assert!(common::errors::ErrorMetadataAnyhowExt::is_config_invalid(&err));
    }

    #[tokio::test]
    async fn test_s7_requires_linked_stack() {
        let text = "[datalogger]\ntype = dummy\nname = t\ndir = ./\n\n[plc]\ntype = \
                    s7\naddress = 10.0.0.2\nrack = 0\nslot = 1\nseconds = 1\n";
        let err = App::new(config(text), ShutdownSignal::no_op(), false)
            .await
            .unwrap_err();
        assert!(common::errors::ErrorMetadataAnyhowExt::is_config_invalid(&err));
    }
}
