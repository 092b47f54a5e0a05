//! SQLite sink backend. A single `rusqlite` connection behind a mutex; the
//! connection does not allow concurrent calls, and the engine's append path
//! is serial anyway.

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::Connection;
use sink::{
    Dialect,
    RelationalSink,
    SqlConnection,
};

pub type SqliteSink = RelationalSink<SqliteConnection>;

/// Opens (or creates) `<dir>/<name>.db`.
pub fn sqlite_sink(dir: &Path, name: &str) -> SqliteSink {
    RelationalSink::new(SqliteConnection::new(dir.join(format!("{name}.db"))))
}

pub struct SqliteConnection {
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl SqliteConnection {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            connection: Mutex::new(None),
        }
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().context("sqlite sink is not open")?;
        f(connection)
    }
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn open(&self) -> anyhow::Result<()> {
        let mut guard = self.connection.lock();
        if guard.is_none() {
            let connection = Connection::open(&self.path).with_context(|| {
                format!("Failed to open sqlite database {}", self.path.display())
            })?;
            *guard = Some(connection);
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the connection closes it; rusqlite flushes on drop.
        *self.connection.lock() = None;
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[String]) -> anyhow::Result<u64> {
        self.with_connection(|connection| {
            let affected = connection.execute(sql, rusqlite::params_from_iter(params))?;
            Ok(affected as u64)
        })
    }

    async fn query(
        &self,
        sql: &str,
        params: &[String],
    ) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        self.with_connection(|connection| {
            let mut stmt = connection.prepare(sql)?;
            let column_count = stmt.column_count();
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(value_to_text(row.get_ref(i)?));
                }
                Ok(values)
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        self.with_connection(|connection| {
            let mut stmt = connection
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(names.collect::<Result<Vec<_>, _>>()?)
        })
    }

    async fn list_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        self.with_connection(|connection| {
            let mut stmt = connection.prepare(&format!(
                "PRAGMA table_info({})",
                Dialect::Sqlite.quote_ident(table)
            ))?;
            // Rows come back in column-id order, i.e. declaration order.
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            Ok(names.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn supports_snapshot(&self) -> bool {
        true
    }

    async fn snapshot(&self, date: NaiveDate) -> anyhow::Result<()> {
        let stem = self.path.with_extension("");
        let target = format!("{}-{}.db", stem.display(), date.format("%Y-%m-%d"));
        self.with_connection(|connection| {
            connection.execute(
                "VACUUM INTO ?1",
                rusqlite::params![target],
            )?;
            Ok(())
        })
    }
}

// Column affinity may have coerced inserted text; queries always come back
// as text.
fn value_to_text(value: rusqlite::types::ValueRef<'_>) -> Option<String> {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(x) => Some(x.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use common::data_type::SqlType;
    use maplit::btreemap;
    use sink::SqlSink;

    use super::*;

    fn temp_sink(dir: &Path) -> SqliteSink {
        sqlite_sink(dir, "t")
    }

    #[tokio::test]
    async fn test_tables_and_headers_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = temp_sink(dir.path());
        sink.open().await?;
        sink.create_data_table(
            "c",
            &[
                ("x".to_owned(), SqlType::Integer),
                ("y".to_owned(), SqlType::Real),
            ],
        )
        .await?;
        assert_eq!(
            sink.headers("c"),
            Some(vec!["TIMESTAMP".to_owned(), "x".to_owned(), "y".to_owned()])
        );
        sink.close().await?;

        // Header discovery on reopen must reproduce the same column order.
        let sink = temp_sink(dir.path());
        sink.open().await?;
        assert_eq!(
            sink.headers("c"),
            Some(vec!["TIMESTAMP".to_owned(), "x".to_owned(), "y".to_owned()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_add_entry_and_null_columns() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = temp_sink(dir.path());
        sink.open().await?;
        sink.create_data_table(
            "c",
            &[
                ("x".to_owned(), SqlType::Integer),
                ("y".to_owned(), SqlType::Real),
            ],
        )
        .await?;
        let row = btreemap! {
            "TIMESTAMP".to_owned() => "2026-01-05 10:00:00,000".to_owned(),
            "x".to_owned() => "1".to_owned(),
        };
        sink.add_entry("c", &row).await?;

        let rows = sink_query(&sink, "SELECT \"TIMESTAMP\", \"x\", \"y\" FROM \"c\"").await?;
        assert_eq!(
            rows,
            vec![vec![
                Some("2026-01-05 10:00:00,000".to_owned()),
                Some("1".to_owned()),
                None,
            ]]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_hostile_values_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = temp_sink(dir.path());
        sink.open().await?;
        sink.create_data_table("c", &[("x".to_owned(), SqlType::Text)])
            .await?;
        let hostile = "\\' OR '1'='1; DROP TABLE \"c\"";
        let row = btreemap! {
            "TIMESTAMP".to_owned() => "2026-01-05 10:00:00,000".to_owned(),
            "x".to_owned() => hostile.to_owned(),
        };
        sink.add_entry("c", &row).await?;
        let rows = sink_query(&sink, "SELECT \"x\" FROM \"c\"").await?;
        assert_eq!(rows, vec![vec![Some(hostile.to_owned())]]);
        Ok(())
    }

    #[tokio::test]
    async fn test_diagnostics_and_configuration() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = temp_sink(dir.path());
        sink.open().await?;
        sink.log("started", false).await?;
        sink.log("it's broken", true).await?;

        let sections = common::ini::parse("[datalogger]\ntype = sqlite\nname = t\ndir = ./\n")?;
        sink.store_configuration(&sections).await?;
        assert_eq!(sink.get_configuration().await?, sections);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_creates_dated_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = temp_sink(dir.path());
        sink.open().await?;
        assert!(sink.is_archiver());
        sink.snapshot(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap())
            .await?;
        assert!(dir.path().join("t-2026-01-05.db").exists());
        Ok(())
    }

    async fn sink_query(
        sink: &SqliteSink,
        sql: &str,
    ) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        sink.connection().query(sql, &[]).await
    }
}
