//! Protocol client: connect, write one request, read one response. The
//! client value holds no connection state and is reusable across calls.

use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use common::errors::ErrorMetadata;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    frame::{
        read_frame,
        write_frame,
    },
    Request,
    Response,
    StatusCode,
};

/// A bad response from the server, carrying the wire status.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("bad response: {status:?}")]
pub struct BadResponse {
    pub status: StatusCode,
}

#[derive(Clone)]
pub struct JidlClient {
    host: String,
    port: u16,
    tls: Arc<ClientConfig>,
}

impl JidlClient {
    pub fn new(host: impl Into<String>, port: u16, tls: Arc<ClientConfig>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// Sends one request and awaits the response. `timeout_ms == 0` waits
    /// forever; otherwise the whole exchange is bounded.
    pub async fn request(&self, request: &Request, timeout_ms: u64) -> anyhow::Result<Response> {
        let exchange = self.exchange(request);
        let response = if timeout_ms == 0 {
            exchange.await?
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), exchange)
                .await
                .with_context(|| {
                    format!("Request to {}:{} timed out", self.host, self.port)
                })??
        };
        match response {
            Response::Bad(status) => Err(anyhow::Error::from(BadResponse { status }).context(
                ErrorMetadata::protocol_error(
                    "BadResponse",
                    format!("Server answered with {status:?}"),
                ),
            )),
            good => Ok(good),
        }
    }

    async fn exchange(&self, request: &Request) -> anyhow::Result<Response> {
        let server_name = ServerName::try_from(self.host.clone())
            .with_context(|| format!("Invalid server name {:?}", self.host))?;
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let connector = TlsConnector::from(self.tls.clone());
        let mut stream = connector.connect(server_name, stream).await?;
        write_frame(&mut stream, &request.to_frame()).await?;
        let frame = read_frame(&mut stream).await?;
        Ok(Response::from_frame(&frame)?)
    }
}
