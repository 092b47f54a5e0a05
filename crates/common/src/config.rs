//! Structured configuration: the pre-parsed form of the INI file that the
//! engine consumes. Binding validates everything up front; a failed load
//! never partially mutates a logger.

use std::{
    collections::BTreeSet,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;

use crate::{
    crypto::CredentialDecryptor,
    data_type::DataType,
    errors::ErrorMetadata,
    ini::{
        self,
        IniSection,
    },
    is_valid_identifier,
    qualifier::Qualifier,
};

const DATALOGGER_SECTION: &str = "datalogger";
const ARCHIVER_SECTION: &str = "dataarchiver";

#[derive(Clone, Debug, PartialEq)]
pub struct JidlConfig {
    pub sink: SinkConfig,
    pub archiver: Option<ArchiverConfig>,
    pub ipc: Option<IpcConfig>,
    pub connections: Vec<ConnectionConfig>,
    /// The parsed sections, kept for persistence into the sink's
    /// configuration table.
    pub sections: Vec<IniSection>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Dummy,
    Sqlite,
    MariaDb,
    MonetDb,
}

impl SinkKind {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "dummy" => Ok(SinkKind::Dummy),
            "sqlite" => Ok(SinkKind::Sqlite),
            "mariadb" => Ok(SinkKind::MariaDb),
            "monetdb" => Ok(SinkKind::MonetDb),
            _ => anyhow::bail!(ErrorMetadata::config_invalid(
                "BadSinkType",
                format!("Unknown datalogger type {s:?}"),
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub name: String,
    pub dir: PathBuf,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiverConfig {
    /// ISO day of week, Monday = 1 .. Sunday = 7.
    pub day: u8,
    pub interval: u32,
    pub monthly: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IpcConfig {
    pub port: u16,
    pub keystore: PathBuf,
    pub keystore_password: Option<String>,
    pub truststore: PathBuf,
    pub truststore_password: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    pub kind: ConnectionKind,
    /// Sample period in deciseconds; ≥ 1.
    pub sample_ticks: u32,
    pub readers: Vec<ReaderConfig>,
    pub writers: Vec<WriterConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionKind {
    S7 {
        address: String,
        rack: u16,
        slot: u16,
    },
    ModbusTcp {
        address: String,
        port: u16,
        reversed: bool,
    },
    OpcUa {
        address: String,
        port: u16,
        path: String,
        discovery: bool,
        username: Option<String>,
        password: Option<String>,
    },
    Json {
        address: String,
    },
    Ipc {
        address: String,
        port: u16,
    },
}

impl ConnectionKind {
    /// A stable label for diagnostics and the parameter view.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionKind::S7 { .. } => "s7",
            ConnectionKind::ModbusTcp { .. } => "modbus-tcp",
            ConnectionKind::OpcUa { .. } => "opcua",
            ConnectionKind::Json { .. } => "json",
            ConnectionKind::Ipc { .. } => "ipc",
        }
    }

    /// The endpoint identity used for client sharing: two connections with
    /// the same view may alias one device client.
    pub fn share_key(&self) -> String {
        match self {
            ConnectionKind::S7 { address, rack, slot } => {
                format!("s7:{address}:{rack}:{slot}")
            },
            ConnectionKind::ModbusTcp { address, port, .. } => {
                format!("modbus-tcp:{address}:{port}")
            },
            ConnectionKind::OpcUa { address, port, path, .. } => {
                format!("opcua:{address}:{port}/{path}")
            },
            ConnectionKind::Json { address } => format!("json:{address}"),
            ConnectionKind::Ipc { address, port } => format!("ipc:{address}:{port}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReaderConfig {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriterConfig {
    pub name: String,
    pub address: String,
    pub source_var: String,
    pub source_connection: String,
    /// Inherited from the source reader at load time.
    pub data_type: DataType,
}

impl JidlConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            ErrorMetadata::config_invalid(
                "UnreadableConfig",
                format!("Cannot read configuration file {}", path.display()),
            )
        })?;
        let sections = ini::parse(&text)?;
        Self::from_sections(sections)
    }

    pub fn from_sections(sections: Vec<IniSection>) -> anyhow::Result<Self> {
        let globals = sections.iter().find(|s| s.name.is_empty());
        let datalogger = sections
            .iter()
            .find(|s| s.name == DATALOGGER_SECTION)
            .with_context(|| {
                ErrorMetadata::config_invalid("MissingSection", "No [datalogger] section")
            })?;

        let key = datalogger.get("key");
        let decryptor = build_decryptor(datalogger, globals)?;
        let sink = parse_sink(datalogger, decryptor.as_ref())?;
        let archiver = sections
            .iter()
            .find(|s| s.name == ARCHIVER_SECTION)
            .map(parse_archiver)
            .transpose()?;
        let ipc = globals.map(|g| parse_ipc(g, decryptor.as_ref())).transpose()?.flatten();

        let mut connections = parse_connections(&sections, key, decryptor.as_ref())?;
        attach_readers(&sections, &mut connections)?;
        attach_writers(&sections, &mut connections)?;

        Ok(Self {
            sink,
            archiver,
            ipc,
            connections,
            sections,
        })
    }
}

/// Key material for password decryption: `key` from [datalogger], `salt` and
/// `iv` from the global section. Absent material means plaintext passwords.
fn build_decryptor(
    datalogger: &IniSection,
    globals: Option<&IniSection>,
) -> anyhow::Result<Option<CredentialDecryptor>> {
    let key = datalogger.get("key");
    let salt = globals.and_then(|g| g.get("salt"));
    let iv = globals.and_then(|g| g.get("iv"));
    match (key, salt, iv) {
        (Some(key), Some(salt), Some(iv)) => Ok(Some(CredentialDecryptor::new(key, salt, iv)?)),
        _ => Ok(None),
    }
}

fn maybe_decrypt(
    value: Option<&str>,
    decryptor: Option<&CredentialDecryptor>,
) -> anyhow::Result<Option<String>> {
    match (value, decryptor) {
        (None, _) => Ok(None),
        (Some(v), None) => Ok(Some(v.to_owned())),
        (Some(v), Some(d)) => Ok(Some(d.decrypt(v)?)),
    }
}

fn parse_sink(
    section: &IniSection,
    decryptor: Option<&CredentialDecryptor>,
) -> anyhow::Result<SinkConfig> {
    let kind = SinkKind::parse(require(section, "type")?)?;
    let name = require(section, "name")?.to_owned();
    let dir = PathBuf::from(require(section, "dir")?);
    anyhow::ensure!(
        dir.is_dir(),
        ErrorMetadata::config_invalid(
            "BadWorkingDir",
            format!("Working directory {} does not exist", dir.display()),
        )
    );
    Ok(SinkConfig {
        kind,
        name,
        dir,
        server: section.get("server").map(str::to_owned),
        port: section
            .get("port")
            .map(|p| parse_number(section, "port", p))
            .transpose()?,
        username: section.get("username").map(str::to_owned),
        password: maybe_decrypt(section.get("password"), decryptor)?,
    })
}

fn parse_archiver(section: &IniSection) -> anyhow::Result<ArchiverConfig> {
    let day = match require(section, "day")? {
        "MONDAY" => 1,
        "TUESDAY" => 2,
        "WEDNESDAY" => 3,
        "THURSDAY" => 4,
        "FRIDAY" => 5,
        "SATURDAY" => 6,
        "SUNDAY" => 7,
        other => anyhow::bail!(ErrorMetadata::config_invalid(
            "BadArchiverDay",
            format!("Unknown day {other:?}"),
        )),
    };
    let interval: u32 = parse_number(section, "interval", require(section, "interval")?)?;
    let monthly = section
        .get("monthly")
        .map(|v| parse_bool(section, "monthly", v))
        .transpose()?
        .unwrap_or(false);
    let max_range = if monthly { 12 } else { 52 };
    anyhow::ensure!(
        (1..=max_range).contains(&interval),
        ErrorMetadata::config_invalid(
            "BadArchiverInterval",
            format!("interval must be in 1..={max_range}"),
        )
    );
    Ok(ArchiverConfig {
        day,
        interval,
        monthly,
    })
}

fn parse_ipc(
    globals: &IniSection,
    decryptor: Option<&CredentialDecryptor>,
) -> anyhow::Result<Option<IpcConfig>> {
    let Some(port) = globals.get("ipc_port") else {
        return Ok(None);
    };
    let port = parse_number(globals, "ipc_port", port)?;
    let keystore = PathBuf::from(require(globals, "ipc_keystore")?);
    let truststore = PathBuf::from(require(globals, "ipc_truststore")?);
    Ok(Some(IpcConfig {
        port,
        keystore,
        keystore_password: maybe_decrypt(globals.get("ipc_keystorepw"), decryptor)?,
        truststore,
        truststore_password: maybe_decrypt(globals.get("ipc_truststorepw"), decryptor)?,
    }))
}

fn parse_connections(
    sections: &[IniSection],
    key: Option<&str>,
    decryptor: Option<&CredentialDecryptor>,
) -> anyhow::Result<Vec<ConnectionConfig>> {
    let mut connections = Vec::new();
    let mut seen = BTreeSet::new();
    for section in sections {
        if section.name.is_empty()
            || section.name == DATALOGGER_SECTION
            || section.name == ARCHIVER_SECTION
        {
            continue;
        }
        let Qualifier::Connection { name } = section.name.parse::<Qualifier>()? else {
            // Reader and writer sections are bound in later passes.
            continue;
        };
        anyhow::ensure!(
            seen.insert(name.clone()),
            ErrorMetadata::bad_argument(
                "DuplicateConnection",
                format!("Duplicate connection {name:?}"),
            )
        );
        let kind = parse_connection_kind(section, key, decryptor)?;
        let sample_ticks = parse_sample_ticks(section)?;
        connections.push(ConnectionConfig {
            name,
            kind,
            sample_ticks,
            readers: Vec::new(),
            writers: Vec::new(),
        });
    }
    Ok(connections)
}

fn parse_connection_kind(
    section: &IniSection,
    key: Option<&str>,
    decryptor: Option<&CredentialDecryptor>,
) -> anyhow::Result<ConnectionKind> {
    let kind = match require(section, "type")? {
        "s7" => ConnectionKind::S7 {
            address: require(section, "address")?.to_owned(),
            rack: parse_number(section, "rack", require(section, "rack")?)?,
            slot: parse_number(section, "slot", require(section, "slot")?)?,
        },
        "modbus-tcp" => ConnectionKind::ModbusTcp {
            address: require(section, "address")?.to_owned(),
            port: section
                .get("port")
                .map(|p| parse_number(section, "port", p))
                .transpose()?
                .unwrap_or(502),
            reversed: section
                .get("reversed")
                .map(|v| parse_bool(section, "reversed", v))
                .transpose()?
                .unwrap_or(false),
        },
        "opcua" => {
            // OPC UA credentials may carry section-local salt/iv, paired
            // with the [datalogger] key.
            let local;
            let effective = match (key, section.get("salt"), section.get("iv")) {
                (Some(key), Some(salt), Some(iv)) => {
                    local = CredentialDecryptor::new(key, salt, iv)?;
                    Some(&local)
                },
                _ => decryptor,
            };
            ConnectionKind::OpcUa {
                address: require(section, "address")?.to_owned(),
                port: parse_number(section, "port", require(section, "port")?)?,
                path: section.get("path").unwrap_or("").to_owned(),
                discovery: section
                    .get("discovery")
                    .map(|v| parse_bool(section, "discovery", v))
                    .transpose()?
                    .unwrap_or(false),
                username: section.get("username").map(str::to_owned),
                password: maybe_decrypt(section.get("password"), effective)?,
            }
        },
        "json" => ConnectionKind::Json {
            address: require(section, "address")?.to_owned(),
        },
        "ipc" => ConnectionKind::Ipc {
            address: require(section, "address")?.to_owned(),
            port: parse_number(section, "port", require(section, "port")?)?,
        },
        other => anyhow::bail!(ErrorMetadata::config_invalid(
            "BadConnectionType",
            format!("Unknown connection type {other:?} in [{}]", section.name),
        )),
    };
    Ok(kind)
}

/// Exactly one of `seconds`/`deciseconds`; seconds scale by ten, decisecond
/// periods above 9 are rounded to the nearest whole second.
fn parse_sample_ticks(section: &IniSection) -> anyhow::Result<u32> {
    let ticks = match (section.get("seconds"), section.get("deciseconds")) {
        (Some(s), None) => parse_number::<u32>(section, "seconds", s)? * 10,
        (None, Some(ds)) => {
            let ds: u32 = parse_number(section, "deciseconds", ds)?;
            if ds > 9 {
                ((ds + 5) / 10) * 10
            } else {
                ds
            }
        },
        _ => anyhow::bail!(ErrorMetadata::config_invalid(
            "BadSamplePeriod",
            format!(
                "[{}] must set exactly one of seconds/deciseconds",
                section.name
            ),
        )),
    };
    anyhow::ensure!(
        ticks >= 1,
        ErrorMetadata::config_invalid(
            "BadSamplePeriod",
            format!("[{}] sample period must be positive", section.name),
        )
    );
    Ok(ticks)
}

fn attach_readers(
    sections: &[IniSection],
    connections: &mut [ConnectionConfig],
) -> anyhow::Result<()> {
    for section in sections {
        if section.name.is_empty() {
            continue;
        }
        let Ok(Qualifier::Reader { var, connection }) = section.name.parse::<Qualifier>() else {
            continue;
        };
        anyhow::ensure!(
            is_valid_identifier(&var),
            ErrorMetadata::bad_argument(
                "BadVariableName",
                format!("Invalid variable name {var:?}"),
            )
        );
        let target = connections
            .iter_mut()
            .find(|c| c.name == connection)
            .with_context(|| {
                ErrorMetadata::config_invalid(
                    "UnknownConnection",
                    format!("[{}] names unknown connection {connection:?}", section.name),
                )
            })?;
        anyhow::ensure!(
            target.readers.iter().all(|r| r.name != var),
            ErrorMetadata::bad_argument(
                "DuplicateVariable",
                format!("Duplicate variable {var:?} on {connection:?}"),
            )
        );
        target.readers.push(ReaderConfig {
            name: var,
            address: require(section, "address")?.to_owned(),
            data_type: DataType::parse(require(section, "type")?)?,
        });
    }
    Ok(())
}

fn attach_writers(
    sections: &[IniSection],
    connections: &mut [ConnectionConfig],
) -> anyhow::Result<()> {
    for section in sections {
        if section.name.is_empty() {
            continue;
        }
        let Ok(Qualifier::Writer {
            var,
            connection,
            source_var,
            source_connection,
        }) = section.name.parse::<Qualifier>()
        else {
            continue;
        };
        anyhow::ensure!(
            is_valid_identifier(&var),
            ErrorMetadata::bad_argument(
                "BadVariableName",
                format!("Invalid variable name {var:?}"),
            )
        );
        let data_type = connections
            .iter()
            .find(|c| c.name == source_connection)
            .and_then(|c| c.readers.iter().find(|r| r.name == source_var))
            .map(|r| r.data_type)
            .with_context(|| {
                ErrorMetadata::config_invalid(
                    "UnknownSource",
                    format!(
                        "[{}] names unknown source {source_var}::{source_connection}",
                        section.name
                    ),
                )
            })?;
        let target = connections
            .iter_mut()
            .find(|c| c.name == connection)
            .with_context(|| {
                ErrorMetadata::config_invalid(
                    "UnknownConnection",
                    format!("[{}] names unknown connection {connection:?}", section.name),
                )
            })?;
        anyhow::ensure!(
            target.writers.iter().all(|w| w.name != var),
            ErrorMetadata::bad_argument(
                "DuplicateVariable",
                format!("Duplicate writer {var:?} on {connection:?}"),
            )
        );
        target.writers.push(WriterConfig {
            name: var,
            address: require(section, "address")?.to_owned(),
            source_var,
            source_connection,
            data_type,
        });
    }
    Ok(())
}

fn require<'a>(section: &'a IniSection, key: &str) -> anyhow::Result<&'a str> {
    section.get(key).with_context(|| {
        ErrorMetadata::config_invalid(
            "MissingKey",
            format!("[{}] is missing {key:?}", section.name),
        )
    })
}

fn parse_number<T: std::str::FromStr>(
    section: &IniSection,
    key: &str,
    value: &str,
) -> anyhow::Result<T> {
    value.trim().parse().map_err(|_| {
        anyhow::anyhow!(ErrorMetadata::config_invalid(
            "BadNumber",
            format!("[{}] {key} = {value:?} is not a valid number", section.name),
        ))
    })
}

fn parse_bool(section: &IniSection, key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => anyhow::bail!(ErrorMetadata::config_invalid(
            "BadBoolean",
            format!("[{}] {key} = {value:?} is not true/false", section.name),
        )),
    }
}
