use std::sync::Arc;

// Used by the polling pipeline to signal it has encountered a fatal sink
// error. The host owns the receiving end and decides how to shut down.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown_tx: async_broadcast::Sender<ShutdownMessage>,
    logger_name: String,
}

#[derive(Clone, Debug)]
pub struct ShutdownMessage {
    pub error: Arc<anyhow::Error>,
    pub logger_name: String,
}

impl ShutdownSignal {
    pub fn new(
        shutdown_tx: async_broadcast::Sender<ShutdownMessage>,
        logger_name: String,
    ) -> Self {
        Self {
            shutdown_tx,
            logger_name,
        }
    }

    pub fn signal(&self, fatal_error: anyhow::Error) {
        let message = ShutdownMessage {
            error: Arc::new(fatal_error),
            logger_name: self.logger_name.clone(),
        };
        if let Err(e) = self.shutdown_tx.try_broadcast(message) {
            tracing::error!("Fatal error had no listener: {}", e.into_inner().error);
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn no_op() -> Self {
        let (sender, _receiver) = async_broadcast::broadcast(1);
        Self {
            shutdown_tx: sender,
            logger_name: "".to_owned(),
        }
    }
}
