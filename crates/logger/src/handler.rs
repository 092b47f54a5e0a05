//! Glue between protocol requests and the live logger.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    qualifier::value_key,
    shutdown::ShutdownSignal,
};
use ipc::{
    Request,
    RequestHandler,
    Response,
    StatusCode,
};
use serde_json::{
    json,
    Map as JsonMap,
    Value as JsonValue,
};

use crate::scheduler::DataLogger;

pub struct LoggerRequestHandler {
    logger: Arc<DataLogger>,
    fatal: ShutdownSignal,
    /// Whether remote `start`/`stop` is permitted (the `-r` flag).
    remote_control: bool,
}

impl LoggerRequestHandler {
    pub fn new(logger: Arc<DataLogger>, fatal: ShutdownSignal, remote_control: bool) -> Self {
        Self {
            logger,
            fatal,
            remote_control,
        }
    }

    /// `values`: payload maps connection names to variable lists; the
    /// response maps `var::connection` keys to the most recent cached
    /// reads. Any unknown name fails the whole request.
    async fn values(&self, payload: Option<JsonValue>) -> Response {
        let Some(JsonValue::Object(wanted)) = payload else {
            return Response::bad(StatusCode::FailedRequestHandling);
        };
        let mut results = JsonMap::new();
        for (connection_name, vars) in wanted {
            let Some(connection) = self.logger.connection(&connection_name).await else {
                return Response::bad(StatusCode::FailedRequestHandling);
            };
            let JsonValue::Array(vars) = vars else {
                return Response::bad(StatusCode::FailedRequestHandling);
            };
            let connection = connection.lock().await;
            for var in vars {
                let Some(var) = var.as_str() else {
                    return Response::bad(StatusCode::FailedRequestHandling);
                };
                let Some(value) = connection.cached_value(var) else {
                    return Response::bad(StatusCode::FailedRequestHandling);
                };
                results.insert(value_key(var, &connection_name), value.to_json());
            }
        }
        Response::OkWithPayload(JsonValue::Object(results))
    }

    async fn start(&self) -> Response {
        if !self.remote_control {
            return Response::bad(StatusCode::FailedRequestHandling);
        }
        if self.logger.status() {
            return Response::Ok;
        }
        match self.logger.start(self.fatal.clone()).await {
            Ok(()) => Response::Ok,
            Err(e) => {
                tracing::warn!("Remote start failed: {e:#}");
                Response::bad(StatusCode::FailedRequestHandling)
            },
        }
    }

    async fn stop(&self) -> Response {
        if !self.remote_control {
            return Response::bad(StatusCode::FailedRequestHandling);
        }
        self.logger.stop().await;
        Response::Ok
    }
}

#[async_trait]
impl RequestHandler for LoggerRequestHandler {
    async fn handle(&self, request: Request) -> Response {
        match request.method.as_deref() {
            Some("values") => self.values(request.payload).await,
            Some("start") => self.start().await,
            Some("stop") => self.stop().await,
            // Reserved for trend queries.
            Some("trends") => Response::OkWithPayload(json!({})),
            _ => Response::bad(StatusCode::FailedRequestHandling),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{
        config::{
            ConnectionConfig,
            ConnectionKind,
            ReaderConfig,
        },
        data_type::DataType,
        value::TagValue,
    };
    use device::{
        testing::ScriptedClient,
        Connection,
    };
    use maplit::btreemap;
    use sink::testing::TestingSink;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    async fn handler_with_values() -> LoggerRequestHandler {
        let config = ConnectionConfig {
            name: "c".to_owned(),
            kind: ConnectionKind::Json {
                address: "http://127.0.0.1:8080/json".to_owned(),
            },
            sample_ticks: 10,
            readers: vec![
                ReaderConfig {
                    name: "a".to_owned(),
                    address: "a".to_owned(),
                    data_type: DataType::Integer,
                },
                ReaderConfig {
                    name: "b".to_owned(),
                    address: "b".to_owned(),
                    data_type: DataType::Real,
                },
            ],
            writers: Vec::new(),
        };
        let client = ScriptedClient::new();
        client.push_values(btreemap! {
            "a".to_owned() => TagValue::Int(5),
            "b".to_owned() => TagValue::Float(1.5),
        });
        let mut connection = Connection::new(&config, client.shared()).unwrap();
        connection.read(chrono::Utc::now()).await.unwrap();
        let logger = Arc::new(DataLogger::new(
            "t",
            vec![Arc::new(AsyncMutex::new(connection))],
            Arc::new(TestingSink::new()),
        ));
        LoggerRequestHandler::new(logger, ShutdownSignal::no_op(), false)
    }

    #[tokio::test]
    async fn test_values_request() {
        let handler = handler_with_values().await;
        let request = Request::with_payload("values", json!({"c": ["a", "b"]}));
        assert_eq!(
            handler.handle(request).await,
            Response::OkWithPayload(json!({"a::c": 5, "b::c": 1.5}))
        );
    }

    #[tokio::test]
    async fn test_values_unknown_variable() {
        let handler = handler_with_values().await;
        let request = Request::with_payload("values", json!({"c": ["missing"]}));
        assert_eq!(
            handler.handle(request).await,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
        let request = Request::with_payload("values", json!({"nope": ["a"]}));
        assert_eq!(
            handler.handle(request).await,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
    }

    #[tokio::test]
    async fn test_control_requires_remote_flag() {
        let handler = handler_with_values().await;
        assert_eq!(
            handler.handle(Request::method("start")).await,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
        assert_eq!(
            handler.handle(Request::method("stop")).await,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handler = handler_with_values().await;
        assert_eq!(
            handler.handle(Request::method("nope")).await,
            Response::Bad(StatusCode::FailedRequestHandling)
        );
        assert_eq!(
            handler.handle(Request::method("trends")).await,
            Response::OkWithPayload(json!({}))
        );
    }
}
