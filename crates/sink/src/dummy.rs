//! The `type = dummy` sink: accepts everything, stores nothing, and traces
//! each entry. Useful for commissioning a configuration before pointing it
//! at a real store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use common::{
    data_type::SqlType,
    ini::IniSection,
};
use parking_lot::Mutex;

use crate::{
    Row,
    SqlSink,
    TIMESTAMP_COLUMN,
};

pub struct DummySink {
    headers: Mutex<BTreeMap<String, Vec<String>>>,
    configuration: Mutex<Vec<IniSection>>,
}

impl DummySink {
    pub fn new() -> Self {
        Self {
            headers: Mutex::new(BTreeMap::new()),
            configuration: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SqlSink for DummySink {
    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn headers(&self, table: &str) -> Option<Vec<String>> {
        self.headers.lock().get(table).cloned()
    }

    async fn create_data_table(
        &self,
        table: &str,
        columns: &[(String, SqlType)],
    ) -> anyhow::Result<()> {
        let mut headers = vec![TIMESTAMP_COLUMN.to_owned()];
        headers.extend(columns.iter().map(|(name, _)| name.clone()));
        self.headers.lock().insert(table.to_owned(), headers);
        Ok(())
    }

    async fn add_entry(&self, table: &str, row: &Row) -> anyhow::Result<()> {
        tracing::info!("[{table}] {row:?}");
        Ok(())
    }

    async fn log(&self, message: &str, is_error: bool) -> anyhow::Result<()> {
        if is_error {
            tracing::warn!("{message}");
        } else {
            tracing::info!("{message}");
        }
        Ok(())
    }

    async fn get_configuration(&self) -> anyhow::Result<Vec<IniSection>> {
        Ok(self.configuration.lock().clone())
    }

    async fn store_configuration(&self, sections: &[IniSection]) -> anyhow::Result<()> {
        *self.configuration.lock() = sections.to_vec();
        Ok(())
    }

    async fn delete_older_than(&self, _horizon: DateTime<Utc>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn snapshot(&self, _date: NaiveDate) -> anyhow::Result<()> {
        anyhow::bail!("dummy sink does not support snapshots")
    }

    fn is_archiver(&self) -> bool {
        false
    }
}
