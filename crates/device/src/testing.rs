//! Scriptable device client for scheduler and connection tests.

use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    errors::ErrorMetadata,
    value::TagValue,
};
use parking_lot::Mutex;

use crate::{
    DeviceClient,
    Reader,
    SharedClient,
    Writer,
};

/// A fake [`DeviceClient`]. Each scripted value map feeds one `read` call;
/// failures can be scripted for connects and reads. The handle is cloneable
/// so tests keep observing after handing the client to a connection.
#[derive(Clone)]
pub struct ScriptedClient {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    initialized: bool,
    connect_calls: usize,
    read_calls: usize,
    fail_connects: usize,
    fail_reads: usize,
    values: VecDeque<BTreeMap<String, TagValue>>,
    repeat: Option<BTreeMap<String, TagValue>>,
    writes: Vec<(String, TagValue)>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn shared(&self) -> SharedClient {
        crate::shared(self.clone())
    }

    /// Queues one read's worth of values.
    pub fn push_values(&self, values: BTreeMap<String, TagValue>) {
        self.inner.lock().values.push_back(values);
    }

    /// Values served once the queue runs dry.
    pub fn repeat_values(&self, values: BTreeMap<String, TagValue>) {
        self.inner.lock().repeat = Some(values);
    }

    pub fn fail_connects(&self, count: usize) {
        self.inner.lock().fail_connects = count;
    }

    pub fn fail_reads(&self, count: usize) {
        self.inner.lock().fail_reads = count;
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.lock().connect_calls
    }

    pub fn read_calls(&self) -> usize {
        self.inner.lock().read_calls
    }

    pub fn writes(&self) -> Vec<(String, TagValue)> {
        self.inner.lock().writes.clone()
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.inner.lock().initialized = true;
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.connect_calls += 1;
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            anyhow::bail!(ErrorMetadata::device_unreachable(
                "ScriptedConnectFailure",
                "scripted connect failure",
            ));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    async fn read(&mut self, readers: &mut [Reader]) -> anyhow::Result<()> {
        let values = {
            let mut inner = self.inner.lock();
            inner.read_calls += 1;
            if inner.fail_reads > 0 {
                inner.fail_reads -= 1;
                anyhow::bail!(ErrorMetadata::device_read_error(
                    "ScriptedReadFailure",
                    "scripted read failure",
                ));
            }
            inner.values.pop_front().or_else(|| inner.repeat.clone())
        };
        if let Some(values) = values {
            for reader in readers {
                if let Some(value) = values.get(reader.variable.name()) {
                    reader.variable.set_value(value.clone());
                }
            }
        }
        Ok(())
    }

    async fn write(&mut self, writers: &mut [Writer]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for writer in writers.iter() {
            if let Some(value) = writer.variable.value() {
                inner
                    .writes
                    .push((writer.variable.name().to_owned(), value.clone()));
            }
        }
        Ok(())
    }
}
