//! In-memory sink for scheduler and archiver tests: records every call and
//! can be scripted to fail inserts.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use common::{
    data_type::SqlType,
    errors::ErrorMetadata,
    ini::IniSection,
};
use parking_lot::Mutex;

use crate::{
    Row,
    SqlSink,
    TIMESTAMP_COLUMN,
};

#[derive(Clone)]
pub struct TestingSink {
    inner: Arc<Inner>,
}

struct Inner {
    headers: Mutex<BTreeMap<String, Vec<String>>>,
    entries: Mutex<Vec<(String, Row)>>,
    logs: Mutex<Vec<(String, bool)>>,
    configuration: Mutex<Vec<IniSection>>,
    retention_deletes: Mutex<Vec<DateTime<Utc>>>,
    snapshots: Mutex<Vec<NaiveDate>>,
    /// Fail every `add_entry` after this many successes.
    fail_entries_after: Mutex<Option<usize>>,
    fail_open: Mutex<bool>,
}

impl TestingSink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                headers: Mutex::new(BTreeMap::new()),
                entries: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                configuration: Mutex::new(Vec::new()),
                retention_deletes: Mutex::new(Vec::new()),
                snapshots: Mutex::new(Vec::new()),
                fail_entries_after: Mutex::new(None),
                fail_open: Mutex::new(false),
            }),
        }
    }

    pub fn fail_entries_after(&self, successes: usize) {
        *self.inner.fail_entries_after.lock() = Some(successes);
    }

    pub fn fail_open(&self) {
        *self.inner.fail_open.lock() = true;
    }

    pub fn entries(&self) -> Vec<(String, Row)> {
        self.inner.entries.lock().clone()
    }

    pub fn logs(&self) -> Vec<(String, bool)> {
        self.inner.logs.lock().clone()
    }

    pub fn retention_deletes(&self) -> Vec<DateTime<Utc>> {
        self.inner.retention_deletes.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<NaiveDate> {
        self.inner.snapshots.lock().clone()
    }
}

#[async_trait]
impl SqlSink for TestingSink {
    async fn open(&self) -> anyhow::Result<()> {
        if *self.inner.fail_open.lock() {
            anyhow::bail!(ErrorMetadata::sink_unavailable(
                "OpenFailed",
                "scripted open failure",
            ));
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn headers(&self, table: &str) -> Option<Vec<String>> {
        self.inner.headers.lock().get(table).cloned()
    }

    async fn create_data_table(
        &self,
        table: &str,
        columns: &[(String, SqlType)],
    ) -> anyhow::Result<()> {
        let mut headers = vec![TIMESTAMP_COLUMN.to_owned()];
        headers.extend(columns.iter().map(|(name, _)| name.clone()));
        self.inner.headers.lock().insert(table.to_owned(), headers);
        Ok(())
    }

    async fn add_entry(&self, table: &str, row: &Row) -> anyhow::Result<()> {
        let mut entries = self.inner.entries.lock();
        if let Some(limit) = *self.inner.fail_entries_after.lock() {
            if entries.len() >= limit {
                anyhow::bail!(ErrorMetadata::sink_unavailable(
                    "InsertFailed",
                    "scripted insert failure",
                ));
            }
        }
        entries.push((table.to_owned(), row.clone()));
        Ok(())
    }

    async fn log(&self, message: &str, is_error: bool) -> anyhow::Result<()> {
        self.inner.logs.lock().push((message.to_owned(), is_error));
        Ok(())
    }

    async fn get_configuration(&self) -> anyhow::Result<Vec<IniSection>> {
        Ok(self.inner.configuration.lock().clone())
    }

    async fn store_configuration(&self, sections: &[IniSection]) -> anyhow::Result<()> {
        *self.inner.configuration.lock() = sections.to_vec();
        Ok(())
    }

    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> anyhow::Result<()> {
        self.inner.retention_deletes.lock().push(horizon);
        Ok(())
    }

    async fn snapshot(&self, date: NaiveDate) -> anyhow::Result<()> {
        self.inner.snapshots.lock().push(date);
        Ok(())
    }

    fn is_archiver(&self) -> bool {
        true
    }
}
