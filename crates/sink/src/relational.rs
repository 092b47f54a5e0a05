//! Generic relational sink. Backends supply a [`SqlConnection`]; table
//! management, header alignment, diagnostics, configuration persistence
//! and retention all live here, above raw statement execution.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use common::{
    data_type::SqlType,
    errors::ErrorMetadata,
    ini::{
        self,
        IniSection,
    },
};
use parking_lot::Mutex;

use crate::{
    bump_timestamp,
    dialect::Dialect,
    format_timestamp,
    Row,
    SqlSink,
    CONFIGURATION_TABLE,
    DIAGNOSTICS_TABLE,
    TIMESTAMP_COLUMN,
};

/// Raw statement execution against one relational store. Implementations
/// serialize their own access; the engine never issues interleaved
/// statements on purpose.
#[async_trait]
pub trait SqlConnection: Send + Sync + 'static {
    fn dialect(&self) -> Dialect;

    async fn open(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    /// Executes one statement; values bind as positional parameters.
    async fn execute(&self, sql: &str, params: &[String]) -> anyhow::Result<u64>;

    async fn query(
        &self,
        sql: &str,
        params: &[String],
    ) -> anyhow::Result<Vec<Vec<Option<String>>>>;

    /// User-visible table names, in store order.
    async fn list_tables(&self) -> anyhow::Result<Vec<String>>;

    /// Column names of one table, in declaration order.
    async fn list_columns(&self, table: &str) -> anyhow::Result<Vec<String>>;

    fn supports_snapshot(&self) -> bool {
        false
    }

    async fn snapshot(&self, _date: NaiveDate) -> anyhow::Result<()> {
        anyhow::bail!("this sink does not support snapshots")
    }
}

pub struct RelationalSink<C: SqlConnection> {
    connection: C,
    headers: Mutex<BTreeMap<String, Vec<String>>>,
}

impl<C: SqlConnection> RelationalSink<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            headers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    fn table_key(&self, table: &str) -> String {
        self.connection.dialect().fold_case(table)
    }

    async fn insert_diagnostics_row(
        &self,
        ts: DateTime<Utc>,
        message: &str,
    ) -> anyhow::Result<()> {
        let (sql, params) = self
            .connection
            .dialect()
            .insert_diagnostics(&format_timestamp(ts), message);
        self.connection.execute(&sql, &params).await?;
        Ok(())
    }
}

#[async_trait]
impl<C: SqlConnection> SqlSink for RelationalSink<C> {
    async fn open(&self) -> anyhow::Result<()> {
        self.connection.open().await?;
        let dialect = self.connection.dialect();
        self.connection
            .execute(&dialect.create_diagnostics_table(), &[])
            .await?;
        self.connection
            .execute(&dialect.create_configuration_table(), &[])
            .await?;

        let reserved = [
            dialect.fold_case(DIAGNOSTICS_TABLE),
            dialect.fold_case(CONFIGURATION_TABLE),
        ];
        let mut discovered = BTreeMap::new();
        for table in self.connection.list_tables().await? {
            if reserved.contains(&table) {
                continue;
            }
            let columns = self.connection.list_columns(&table).await?;
            discovered.insert(table, columns);
        }
        *self.headers.lock() = discovered;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connection.close().await
    }

    fn headers(&self, table: &str) -> Option<Vec<String>> {
        self.headers.lock().get(&self.table_key(table)).cloned()
    }

    async fn create_data_table(
        &self,
        table: &str,
        columns: &[(String, SqlType)],
    ) -> anyhow::Result<()> {
        let dialect = self.connection.dialect();
        let key = self.table_key(table);
        let existing = self.headers.lock().get(&key).cloned();
        match existing {
            None => {
                let sql = dialect.create_data_table(table, columns);
                self.connection.execute(&sql, &[]).await?;
                let mut headers = vec![dialect.fold_case(TIMESTAMP_COLUMN)];
                headers.extend(columns.iter().map(|(name, _)| dialect.fold_case(name)));
                self.headers.lock().insert(key, headers);
            },
            Some(mut headers) => {
                // The table survived a restart; extend it with any reader
                // columns added since.
                for (name, sql_type) in columns {
                    let folded = dialect.fold_case(name);
                    if !headers.contains(&folded) {
                        self.connection
                            .execute(&dialect.add_column(table, name, *sql_type), &[])
                            .await?;
                        headers.push(folded);
                    }
                }
                self.headers.lock().insert(key, headers);
            },
        }
        Ok(())
    }

    async fn add_entry(&self, table: &str, row: &Row) -> anyhow::Result<()> {
        let headers = self.headers(table).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::bad_argument(
                "UnknownTable",
                format!("No table for connection {table:?}"),
            ))
        })?;
        let (sql, params) = self.connection.dialect().insert_row(table, &headers, row);
        self.connection.execute(&sql, &params).await.map_err(|e| {
            e.context(ErrorMetadata::sink_unavailable(
                "InsertFailed",
                format!("Insert into {table:?} failed"),
            ))
        })?;
        Ok(())
    }

    async fn log(&self, message: &str, is_error: bool) -> anyhow::Result<()> {
        let message = if is_error {
            // Historical quirk: only the error path escapes quotes.
            message.replace('\'', "''")
        } else {
            message.to_owned()
        };
        let now = Utc::now();
        let result = match self.insert_diagnostics_row(now, &message).await {
            Ok(()) => Ok(()),
            // Retry once with a bumped timestamp; sub-millisecond log calls
            // collide on the TIMESTAMP primary key.
            Err(_) => self.insert_diagnostics_row(bump_timestamp(now), &message).await,
        };
        result.map_err(|e| {
            if is_error {
                e.context(ErrorMetadata::sink_unavailable(
                    "DiagnosticsInsertFailed",
                    "Diagnostics insert failed",
                ))
            } else {
                e
            }
        })
    }

    async fn get_configuration(&self) -> anyhow::Result<Vec<IniSection>> {
        let sql = self.connection.dialect().select_configuration();
        let mut sections = Vec::new();
        for row in self.connection.query(&sql, &[]).await? {
            let data = row.get(1).cloned().flatten().unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            sections.extend(ini::parse(&data)?);
        }
        Ok(sections)
    }

    async fn store_configuration(&self, sections: &[IniSection]) -> anyhow::Result<()> {
        let dialect = self.connection.dialect();
        self.connection
            .execute(&dialect.clear_configuration(), &[])
            .await?;
        for section in sections {
            let (sql, params) =
                dialect.insert_configuration(&section.name, &section.serialize());
            self.connection.execute(&sql, &params).await?;
        }
        Ok(())
    }

    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> anyhow::Result<()> {
        let dialect = self.connection.dialect();
        let horizon = format_timestamp(horizon);
        let mut tables: Vec<String> = self.headers.lock().keys().cloned().collect();
        tables.push(dialect.fold_case(DIAGNOSTICS_TABLE));
        for table in tables {
            let (sql, params) = dialect.delete_older_than(&table, &horizon);
            self.connection.execute(&sql, &params).await?;
        }
        Ok(())
    }

    async fn snapshot(&self, date: NaiveDate) -> anyhow::Result<()> {
        self.connection.snapshot(date).await
    }

    fn is_archiver(&self) -> bool {
        self.connection.supports_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::errors::ErrorMetadataAnyhowExt;
    use maplit::btreemap;

    use super::*;

    /// Records every statement and its parameters; can fail the next N
    /// executes.
    #[derive(Clone, Default)]
    struct FakeConnection {
        statements: Arc<Mutex<Vec<(String, Vec<String>)>>>,
        fail_next: Arc<Mutex<usize>>,
    }

    impl FakeConnection {
        fn statements(&self) -> Vec<(String, Vec<String>)> {
            self.statements.lock().clone()
        }

        fn fail_next(&self, count: usize) {
            *self.fail_next.lock() = count;
        }
    }

    #[async_trait]
    impl SqlConnection for FakeConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn execute(&self, sql: &str, params: &[String]) -> anyhow::Result<u64> {
            {
                let mut fail_next = self.fail_next.lock();
                if *fail_next > 0 {
                    *fail_next -= 1;
                    anyhow::bail!("constraint violation");
                }
            }
            self.statements
                .lock()
                .push((sql.to_owned(), params.to_vec()));
            Ok(1)
        }

        async fn query(
            &self,
            _sql: &str,
            _params: &[String],
        ) -> anyhow::Result<Vec<Vec<Option<String>>>> {
            Ok(Vec::new())
        }

        async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_columns(&self, _table: &str) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_open_creates_reserved_tables() -> anyhow::Result<()> {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        sink.open().await?;
        let statements = connection.statements();
        assert!(statements[0].0.contains("JIDL Diagnostics"));
        assert!(statements[1].0.contains("JIDL Configuration"));
        Ok(())
    }

    #[tokio::test]
    async fn test_log_escapes_quotes_only_on_error() -> anyhow::Result<()> {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        sink.log("it's fine", false).await?;
        sink.log("it's broken", true).await?;
        let statements = connection.statements();
        // Messages ride as parameters; the error path additionally doubles
        // embedded quotes in the stored text.
        assert_eq!(statements[0].1[1], "it's fine");
        assert_eq!(statements[1].1[1], "it''s broken");
        Ok(())
    }

    #[tokio::test]
    async fn test_log_collision_retries_with_bumped_timestamp() -> anyhow::Result<()> {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        connection.fail_next(1);
        sink.log("ping", false).await?;
        // The retry landed even though the first insert collided.
        assert_eq!(connection.statements().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_error_log_is_sink_unavailable() {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        connection.fail_next(2);
        let err = sink.log("down", true).await.unwrap_err();
        assert!(err.is_sink_unavailable());

        // The non-error path does not escalate.
        connection.fail_next(2);
        let err = sink.log("down", false).await.unwrap_err();
        assert!(!err.is_sink_unavailable());
    }

    #[tokio::test]
    async fn test_add_entry_unknown_table() {
        let sink = RelationalSink::new(FakeConnection::default());
        let row = btreemap! {"TIMESTAMP".to_owned() => "t".to_owned()};
        let err = sink.add_entry("nope", &row).await.unwrap_err();
        assert!(err.is_bad_argument());
    }

    #[tokio::test]
    async fn test_insert_failure_is_sink_unavailable() -> anyhow::Result<()> {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        sink.create_data_table("c", &[("x".to_owned(), SqlType::Integer)])
            .await?;
        connection.fail_next(1);
        let row = btreemap! {
            "TIMESTAMP".to_owned() => "t".to_owned(),
            "x".to_owned() => "1".to_owned(),
        };
        let err = sink.add_entry("c", &row).await.unwrap_err();
        assert!(err.is_sink_unavailable());
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_covers_user_tables_and_diagnostics() -> anyhow::Result<()> {
        let connection = FakeConnection::default();
        let sink = RelationalSink::new(connection.clone());
        sink.create_data_table("c", &[("x".to_owned(), SqlType::Integer)])
            .await?;
        let horizon = Utc::now();
        sink.delete_older_than(horizon).await?;
        let deletes: Vec<(String, Vec<String>)> = connection
            .statements()
            .into_iter()
            .filter(|(s, _)| s.starts_with("DELETE"))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().any(|(s, _)| s.contains("\"c\"")));
        assert!(deletes.iter().any(|(s, _)| s.contains("JIDL Diagnostics")));
        assert!(deletes.iter().all(|(_, p)| p.len() == 1));
        Ok(())
    }
}
