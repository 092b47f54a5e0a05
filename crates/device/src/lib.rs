//! The device layer: connections, their typed variables, and the
//! [`DeviceClient`] capability the polling pipeline drives.
//!
//! Concrete protocol stacks stay behind capability traits. The crate ships
//! a Modbus TCP transport, a JSON/HTTP client, and an IPC-as-client
//! adapter; S7 and OPC UA expose their typed-tag layer over a transport
//! trait supplied by the embedder.

use std::sync::Arc;

use async_trait::async_trait;

pub mod connection;
pub mod json;
pub mod modbus;
pub mod s7;
pub mod tag_client;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod ipc_client;
mod variable;

pub use connection::{
    Connection,
    Status,
};
pub use ipc_client::IpcDeviceClient;
pub use variable::{
    Address,
    Reader,
    Variable,
    Writer,
};

/// The uniform capability the scheduler sees for every protocol.
///
/// `read` walks the connection's reader list in order, updating each
/// reader's cached value; `write` pushes the writers' current values out.
/// Both honor a per-request deadline internal to the client.
#[async_trait]
pub trait DeviceClient: Send + 'static {
    async fn initialize(&mut self) -> anyhow::Result<()>;

    async fn connect(&mut self) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;

    fn is_initialized(&self) -> bool;

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()>;

    async fn write(&mut self, writers: &mut [Writer]) -> anyhow::Result<()>;
}

/// Clients are owned by one connection, except when two shareable
/// connections target the same endpoint and alias one client. The mutex
/// guarantees a shared client never serves two reads concurrently.
pub type SharedClient = Arc<tokio::sync::Mutex<Box<dyn DeviceClient>>>;

pub fn shared(client: impl DeviceClient) -> SharedClient {
    Arc::new(tokio::sync::Mutex::new(Box::new(client)))
}
