//! The protocol server: a TLS listener that reads one framed request per
//! accepted connection, dispatches it to the handler, writes one framed
//! response and closes.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::{
    net::{
        TcpListener,
        TcpStream,
    },
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    frame::{
        read_frame,
        write_frame,
        FrameError,
    },
    Request,
    RequestHandler,
    Response,
};

/// Upper bound on concurrently served connections.
const WORKER_POOL_SIZE: usize = 8;

/// A slow peer cannot hold a worker slot forever.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(30);

pub struct JidlServer {
    port: u16,
    tls: Arc<ServerConfig>,
    handler: Arc<dyn RequestHandler>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl JidlServer {
    pub fn new(port: u16, tls: Arc<ServerConfig>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            port,
            tls,
            handler,
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the listener and spawns the accept loop. Idempotent when
    /// already started.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut task = self.accept_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let listener = std::net::TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let acceptor = TlsAcceptor::from(self.tls.clone());
        let handler = self.handler.clone();
        let port = self.port;
        *task = Some(tokio::spawn(async move {
            tracing::info!("IPC server listening on {port}");
            accept_loop(listener, acceptor, handler).await;
        }));
        Ok(())
    }

    /// Closes the listener; connections already being served finish on
    /// their own deadline. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            tracing::info!("IPC server stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for JidlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: Arc<dyn RequestHandler>,
) {
    let workers = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("IPC accept failed: {e}");
                continue;
            },
        };
        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let acceptor = acceptor.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let served = tokio::time::timeout(
                CONNECTION_DEADLINE,
                serve_connection(stream, peer, acceptor, handler),
            )
            .await;
            match served {
                Ok(Ok(())) => {},
                Ok(Err(e)) => tracing::debug!("IPC connection from {peer} failed: {e:#}"),
                Err(_) => tracing::debug!("IPC connection from {peer} timed out"),
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<dyn RequestHandler>,
) -> anyhow::Result<()> {
    let mut stream = acceptor.accept(stream).await?;
    tracing::debug!("IPC connection from {peer}");
    serve_stream(&mut stream, handler).await?;
    tokio::io::AsyncWriteExt::shutdown(&mut stream).await?;
    Ok(())
}

/// One request in, one response out, over an established stream.
async fn serve_stream<S>(stream: &mut S, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let response = match read_frame(stream).await {
        Ok(frame) => match Request::from_frame(&frame) {
            Ok(request) => handler.handle(request).await,
            Err(e) => Response::bad(e.status()),
        },
        Err(e) => {
            // Frame-shaped garbage gets a typed bad response; transport
            // failures just drop the connection.
            match e.downcast_ref::<FrameError>() {
                Some(frame_error) => Response::bad(frame_error.status()),
                None => return Err(e),
            }
        },
    };
    write_frame(stream, &response.to_frame()).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::StatusCode;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: Request) -> Response {
            match request.method.as_deref() {
                Some("values") => Response::OkWithPayload(request.payload.unwrap_or(json!({}))),
                _ => Response::bad(StatusCode::FailedRequestHandling),
            }
        }
    }

    #[tokio::test]
    async fn test_serve_one_request() -> anyhow::Result<()> {
        let (mut peer, mut served) = tokio::io::duplex(4096);
        let request = Request::with_payload("values", json!({"c": ["a"]}));
        write_frame(&mut peer, &request.to_frame()).await?;
        serve_stream(&mut served, Arc::new(EchoHandler)).await?;
        let frame = read_frame(&mut peer).await?;
        assert_eq!(
            Response::from_frame(&frame)?,
            Response::OkWithPayload(json!({"c": ["a"]}))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_response() -> anyhow::Result<()> {
        let (mut peer, mut served) = tokio::io::duplex(4096);
        write_frame(&mut peer, &Request::method("nope").to_frame()).await?;
        serve_stream(&mut served, Arc::new(EchoHandler)).await?;
        let frame = read_frame(&mut peer).await?;
        assert_eq!(
            Response::from_frame(&frame)?,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_garbage_gets_typed_bad_response() -> anyhow::Result<()> {
        let (mut peer, mut served) = tokio::io::duplex(4096);
        peer.write_all(&[0u8; 16]).await?;
        serve_stream(&mut served, Arc::new(EchoHandler)).await?;
        let frame = read_frame(&mut peer).await?;
        assert_eq!(frame.status, StatusCode::UnrecognizedProtocol);
        assert_eq!(frame.body, json!({"message": "unrecognized protocol"}));
        Ok(())
    }
}
