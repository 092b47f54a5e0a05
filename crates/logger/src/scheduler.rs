//! The tick-driven polling pipeline.
//!
//! One dispatch loop per logger: every tick it fans read tasks out across
//! the due connections, waits for all of them on a completion barrier, then
//! fires the write tasks without gating the next tick. Two ticks never
//! dispatch concurrently.

use std::{
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use common::{
    errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    },
    shutdown::ShutdownSignal,
};
use device::Connection;
use parking_lot::Mutex;
use sink::{
    format_timestamp,
    SqlSink,
    TIMESTAMP_COLUMN,
};
use tokio::{
    sync::{
        watch,
        Mutex as AsyncMutex,
    },
    task::{
        JoinHandle,
        JoinSet,
    },
};

use crate::metrics;

/// Grace period for in-flight tasks on `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(3);

pub type SharedConnection = Arc<AsyncMutex<Connection>>;

pub struct DataLogger {
    name: String,
    connections: Arc<Vec<SharedConnection>>,
    sink: Arc<dyn SqlSink>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DataLogger {
    pub fn new(
        name: impl Into<String>,
        connections: Vec<SharedConnection>,
        sink: Arc<dyn SqlSink>,
    ) -> Self {
        Self {
            name: name.into(),
            connections: Arc::new(connections),
            sink,
            scheduler: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sink(&self) -> Arc<dyn SqlSink> {
        self.sink.clone()
    }

    pub fn connections(&self) -> &[SharedConnection] {
        &self.connections
    }

    pub async fn connection(&self, name: &str) -> Option<SharedConnection> {
        for connection in self.connections.iter() {
            if connection.lock().await.name() == name {
                return Some(connection.clone());
            }
        }
        None
    }

    /// Arms the ticker. Returns immediately; reads happen on the spawned
    /// dispatch loop. A second `start` while armed is a no-op.
    pub async fn start(&self, fatal: ShutdownSignal) -> anyhow::Result<()> {
        {
            let scheduler = self.scheduler.lock();
            if scheduler.as_ref().is_some_and(|s| !s.task.is_finished()) {
                return Ok(());
            }
        }
        self.sink.open().await.map_err(|e| {
            e.context(ErrorMetadata::logger_not_ready(
                "SinkUnopenable",
                "Cannot start logging: the sink will not open",
            ))
        })?;

        let step = self.tick_step().await;
        let step_ds = (step.as_millis() / 100) as u64;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_scheduler(
            self.connections.clone(),
            self.sink.clone(),
            fatal,
            step,
            step_ds,
            stop_tx.clone(),
            stop_rx,
        ));
        *self.scheduler.lock() = Some(SchedulerHandle { stop_tx, task });
        let _ = self.sink.log("Logging started", false).await;
        Ok(())
    }

    /// True while the ticker is armed.
    pub fn status(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Requests orderly shutdown, waits out the grace period, then forces
    /// termination and disconnects every connection. Idempotent.
    pub async fn stop(&self) {
        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle.task).await.is_err() {
                tracing::warn!("Scheduler did not stop within {STOP_GRACE:?}; aborting");
                abort.abort();
            }
        }
        for connection in self.connections.iter() {
            connection.lock().await.disconnect().await;
        }
        let _ = self.sink.log("Logging stopped", false).await;
        let _ = self.sink.close().await;
    }

    /// 100 ms ticks when any connection samples faster than one second.
    async fn tick_step(&self) -> Duration {
        for connection in self.connections.iter() {
            if connection.lock().await.sample_ticks() < 10 {
                return Duration::from_millis(100);
            }
        }
        Duration::from_secs(1)
    }
}

async fn run_scheduler(
    connections: Arc<Vec<SharedConnection>>,
    sink: Arc<dyn SqlSink>,
    fatal: ShutdownSignal,
    step: Duration,
    step_ds: u64,
    stop_tx: watch::Sender<bool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(step);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);
    // The first tick of a tokio interval completes immediately; the logical
    // clock starts one step after start().
    interval.tick().await;
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = interval.tick() => {},
        }
        counter += step_ds;
        metrics::log_tick();

        // Fan out the due reads, then hold the barrier until all of them
        // settled.
        let mut barrier = JoinSet::new();
        let mut writers_due = Vec::new();
        for connection in connections.iter() {
            let (due, has_readers, writeable) = {
                let c = connection.lock().await;
                (c.is_due(counter), !c.readers().is_empty(), c.is_writeable())
            };
            if !due {
                continue;
            }
            if writeable {
                writers_due.push(connection.clone());
            }
            if has_readers {
                barrier.spawn(read_task(
                    connection.clone(),
                    sink.clone(),
                    fatal.clone(),
                    stop_tx.clone(),
                ));
            }
        }
        while let Some(joined) = barrier.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Read task panicked: {e}");
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        // Writes are fire-and-forget: they must not gate the next tick.
        for connection in writers_due {
            tokio::spawn(write_task(connection, connections.clone(), sink.clone()));
        }
    }
}

async fn read_task(
    connection: SharedConnection,
    sink: Arc<dyn SqlSink>,
    fatal: ShutdownSignal,
    stop_tx: watch::Sender<bool>,
) {
    let now = Utc::now();
    let (name, was_connected, read_result) = {
        let mut c = connection.lock().await;
        let was_connected = c.status() == device::Status::Connected;
        let result = c.read(now).await;
        (c.name().to_owned(), was_connected, result)
    };
    match read_result {
        Ok(()) => {
            if !was_connected {
                let _ = sink
                    .log(&format!("Connection {name} is connected"), false)
                    .await;
            }
            let mut row = {
                let c = connection.lock().await;
                c.all_data_as_text()
            };
            row.insert(TIMESTAMP_COLUMN.to_owned(), format_timestamp(now));
            match sink.add_entry(&name, &row).await {
                Ok(()) => metrics::log_row_appended(&name),
                Err(e) if e.is_sink_unavailable() => {
                    tracing::error!("Sink unavailable; stopping the logger: {e:#}");
                    fatal.signal(e);
                    let _ = stop_tx.send(true);
                },
                Err(e) => {
                    tracing::warn!("Dropped sample of {name}: {e:#}");
                },
            }
        },
        Err(e) => {
            metrics::log_read_failure(&name);
            {
                let mut c = connection.lock().await;
                c.disconnect().await;
            }
            let message = if was_connected {
                format!("Connection {name} is disconnected: {e:#}")
            } else {
                format!("Connection {name} is unreachable: {e:#}")
            };
            match sink.log(&message, true).await {
                Ok(()) => {},
                Err(log_error) if log_error.is_sink_unavailable() => {
                    tracing::error!("Sink unavailable; stopping the logger: {log_error:#}");
                    fatal.signal(log_error);
                    let _ = stop_tx.send(true);
                },
                Err(log_error) => {
                    tracing::warn!("Diagnostics write failed: {log_error:#}");
                },
            }
        },
    }
}

async fn write_task(
    connection: SharedConnection,
    connections: Arc<Vec<SharedConnection>>,
    sink: Arc<dyn SqlSink>,
) {
    // Bind each writer to the latest value of its source reader.
    let bindings: Vec<(String, String, String)> = {
        let c = connection.lock().await;
        c.writers()
            .iter()
            .map(|w| {
                (
                    w.variable.name().to_owned(),
                    w.source_var.clone(),
                    w.source_connection.clone(),
                )
            })
            .collect()
    };
    for (writer_var, source_var, source_connection) in bindings {
        let mut source_value = None;
        for candidate in connections.iter() {
            let c = candidate.lock().await;
            if c.name() == source_connection {
                source_value = c.cached_value(&source_var);
                break;
            }
        }
        if let Some(value) = source_value {
            connection
                .lock()
                .await
                .set_writer_value(&writer_var, value);
        }
    }

    let (name, result) = {
        let mut c = connection.lock().await;
        let result = c.write().await;
        (c.name().to_owned(), result)
    };
    if let Err(e) = result {
        {
            let mut c = connection.lock().await;
            c.disconnect().await;
        }
        let _ = sink
            .log(&format!("Write on {name} failed: {e:#}"), true)
            .await;
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
    use device::testing::ScriptedClient;
    use maplit::btreemap;
    use sink::testing::TestingSink;

    use super::*;

    fn json_connection(name: &str, sample_ticks: u32) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_owned(),
            kind: ConnectionKind::Json {
                address: "http://127.0.0.1:8080/json".to_owned(),
            },
            sample_ticks,
            readers: vec![ReaderConfig {
                name: "x".to_owned(),
                address: "foo".to_owned(),
                data_type: DataType::Integer,
            }],
            writers: Vec::new(),
        }
    }

    async fn build_logger(
        configs: &[ConnectionConfig],
        clients: &[ScriptedClient],
        sink: TestingSink,
    ) -> DataLogger {
        let mut connections = Vec::new();
        for (config, client) in configs.iter().zip(clients) {
            sink.create_data_table(
                &config.name,
                &config
                    .readers
                    .iter()
                    .map(|r| (r.name.clone(), r.data_type.sql_type()))
                    .collect::<Vec<_>>(),
            )
            .await
            .unwrap();
            let connection = Connection::new(config, client.shared()).unwrap();
            connections.push(Arc::new(AsyncMutex::new(connection)));
        }
        DataLogger::new("t", connections, Arc::new(sink))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_ticks_three_rows() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let client = ScriptedClient::new();
        for n in 1..=3 {
            client.push_values(btreemap! {"x".to_owned() => TagValue::Int(n)});
        }
        let logger = build_logger(&[json_connection("c", 10)], &[client], sink.clone()).await;
        logger.start(ShutdownSignal::no_op()).await?;
        assert!(logger.status());

        tokio::time::sleep(Duration::from_millis(3_050)).await;
        logger.stop().await;
        assert!(!logger.status());

        let entries = sink.entries();
        assert_eq!(entries.len(), 3);
        for (i, (table, row)) in entries.iter().enumerate() {
            assert_eq!(table, "c");
            assert!(row.contains_key(TIMESTAMP_COLUMN));
            assert_eq!(row.get("x"), Some(&(i as i64 + 1).to_string()));
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connection_reads_every_other_tick() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let fast = ScriptedClient::new();
        fast.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(1)});
        let slow = ScriptedClient::new();
        slow.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(2)});
        let logger = build_logger(
            &[json_connection("fast", 10), json_connection("slow", 20)],
            &[fast, slow.clone()],
            sink.clone(),
        )
        .await;
        logger.start(ShutdownSignal::no_op()).await?;
        tokio::time::sleep(Duration::from_millis(4_050)).await;
        logger.stop().await;

        let entries = sink.entries();
        let fast_rows = entries.iter().filter(|(t, _)| t == "fast").count();
        let slow_rows = entries.iter().filter(|(t, _)| t == "slow").count();
        assert_eq!(fast_rows, 4);
        assert_eq!(slow_rows, 2);
        assert_eq!(slow.read_calls(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_fatal() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        sink.fail_entries_after(1);
        let client = ScriptedClient::new();
        client.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(1)});
        let logger = Arc::new(
            build_logger(&[json_connection("c", 10)], &[client], sink.clone()).await,
        );

        let (fatal_tx, mut fatal_rx) = async_broadcast::broadcast(1);
        logger
            .start(ShutdownSignal::new(fatal_tx, "t".to_owned()))
            .await?;
        tokio::time::sleep(Duration::from_millis(5_050)).await;

        // The fatal handler fired once and the scheduler stopped itself; no
        // further entries after the failing one.
        let message = fatal_rx.try_recv().expect("fatal handler invoked");
        assert!(message.error.is_sink_unavailable());
        assert!(fatal_rx.try_recv().is_err());
        assert_eq!(sink.entries().len(), 1);
        logger.stop().await;
        assert!(!logger.status());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_quarantines_connection() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let flaky = ScriptedClient::new();
        flaky.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(7)});
        flaky.fail_reads(1);
        let healthy = ScriptedClient::new();
        healthy.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(1)});
        let logger = build_logger(
            &[json_connection("flaky", 10), json_connection("healthy", 10)],
            &[flaky.clone(), healthy],
            sink.clone(),
        )
        .await;
        logger.start(ShutdownSignal::no_op()).await?;
        tokio::time::sleep(Duration::from_millis(2_050)).await;
        logger.stop().await;

        let entries = sink.entries();
        // The healthy connection logged both ticks; the flaky one lost its
        // first tick, reconnected, and logged the second.
        assert_eq!(entries.iter().filter(|(t, _)| t == "healthy").count(), 2);
        assert_eq!(entries.iter().filter(|(t, _)| t == "flaky").count(), 1);
        // The failure went to diagnostics as an error row.
        assert!(sink.logs().iter().any(|(m, is_error)| *is_error
            && m.contains("flaky")));
        // Disconnect then reconnect: two connect calls in total.
        assert_eq!(flaky.connect_calls(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let client = ScriptedClient::new();
        client.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(1)});
        let logger = build_logger(&[json_connection("c", 10)], &[client], sink.clone()).await;
        logger.start(ShutdownSignal::no_op()).await?;
        logger.start(ShutdownSignal::no_op()).await?;
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        logger.stop().await;
        // One ticker: one row for the single elapsed tick, not two.
        assert_eq!(sink.entries().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unopenable_sink_refuses_start() {
        let sink = TestingSink::new();
        sink.fail_open();
        let client = ScriptedClient::new();
        let logger = build_logger(&[json_connection("c", 10)], &[client], sink).await;
        let err = logger.start(ShutdownSignal::no_op()).await.unwrap_err();
        assert_eq!(
            err.error_code(),
            Some(common::errors::ErrorCode::LoggerNotReady)
        );
        assert!(!logger.status());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writers_fed_from_source_after_barrier() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let source = ScriptedClient::new();
        source.repeat_values(btreemap! {"x".to_owned() => TagValue::Int(42)});

        let mut sink_config = ConnectionConfig {
            name: "out".to_owned(),
            kind: ConnectionKind::ModbusTcp {
                address: "10.0.0.9".to_owned(),
                port: 502,
                reversed: false,
            },
            sample_ticks: 10,
            readers: Vec::new(),
            writers: Vec::new(),
        };
        sink_config.writers.push(common::config::WriterConfig {
            name: "setpoint".to_owned(),
            address: "40001".to_owned(),
            source_var: "x".to_owned(),
            source_connection: "c".to_owned(),
            data_type: DataType::Integer,
        });
        let writer_client = ScriptedClient::new();

        let source_connection = Connection::new(&json_connection("c", 10), source.shared())?;
        let writer_connection = Connection::new(&sink_config, writer_client.shared())?;
        sink.create_data_table("c", &[("x".to_owned(), DataType::Integer.sql_type())])
            .await?;
        let logger = DataLogger::new(
            "t",
            vec![
                Arc::new(AsyncMutex::new(source_connection)),
                Arc::new(AsyncMutex::new(writer_connection)),
            ],
            Arc::new(sink),
        );
        logger.start(ShutdownSignal::no_op()).await?;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        logger.stop().await;

        let writes = writer_client.writes();
        assert!(!writes.is_empty());
        assert_eq!(writes[0], ("setpoint".to_owned(), TagValue::Int(42)));
        Ok(())
    }
}
