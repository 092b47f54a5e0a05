//! MariaDB sink backend over a `mysql_async` pool. Server-side databases
//! have no file snapshot, so this sink does not support the archiver.

use anyhow::Context;
use async_trait::async_trait;
use mysql_async::{
    prelude::Queryable,
    Opts,
    OptsBuilder,
    Params,
    Pool,
    Row as MySqlRow,
    Value,
};
use parking_lot::Mutex;
use sink::{
    Dialect,
    RelationalSink,
    SqlConnection,
};

pub type MariaDbSink = RelationalSink<MariaDbConnection>;

pub struct MariaDbOptions {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

pub fn mariadb_sink(options: MariaDbOptions) -> MariaDbSink {
    RelationalSink::new(MariaDbConnection::new(options))
}

pub struct MariaDbConnection {
    opts: Opts,
    pool: Mutex<Option<Pool>>,
}

impl MariaDbConnection {
    pub fn new(options: MariaDbOptions) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(options.server)
            .tcp_port(options.port)
            .user(options.username)
            .pass(options.password)
            .db_name(Some(options.database))
            .into();
        Self {
            opts,
            pool: Mutex::new(None),
        }
    }

    fn pool(&self) -> anyhow::Result<Pool> {
        self.pool
            .lock()
            .clone()
            .context("mariadb sink is not open")
    }
}

#[async_trait]
impl SqlConnection for MariaDbConnection {
    fn dialect(&self) -> Dialect {
        Dialect::MariaDb
    }

    async fn open(&self) -> anyhow::Result<()> {
        let pool = {
            let mut guard = self.pool.lock();
            if guard.is_none() {
                *guard = Some(Pool::new(self.opts.clone()));
            }
            guard.clone().expect("just set")
        };
        // Pool construction is lazy; probe so an unreachable server fails
        // the open instead of the first insert.
        let mut conn = pool
            .get_conn()
            .await
            .context("Failed to connect to MariaDB")?;
        conn.query_drop("SELECT 1").await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.disconnect().await?;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[String]) -> anyhow::Result<u64> {
        let mut conn = self.pool()?.get_conn().await?;
        // DDL goes over the text protocol; anything carrying values binds
        // them as prepared-statement parameters.
        if params.is_empty() {
            conn.query_drop(sql).await?;
        } else {
            conn.exec_drop(sql, to_params(params)).await?;
        }
        Ok(conn.affected_rows())
    }

    async fn query(
        &self,
        sql: &str,
        params: &[String],
    ) -> anyhow::Result<Vec<Vec<Option<String>>>> {
        let mut conn = self.pool()?.get_conn().await?;
        let rows: Vec<MySqlRow> = if params.is_empty() {
            conn.query(sql).await?
        } else {
            conn.exec(sql, to_params(params)).await?
        };
        Ok(rows
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| value_to_text(&row[i]))
                    .collect()
            })
            .collect())
    }

    async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        let mut conn = self.pool()?.get_conn().await?;
        let names: Vec<String> = conn
            .query(
                "SELECT table_name FROM information_schema.tables WHERE table_schema = \
                 DATABASE() ORDER BY table_name",
            )
            .await?;
        Ok(names)
    }

    async fn list_columns(&self, table: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.pool()?.get_conn().await?;
        let names: Vec<String> = conn
            .exec(
                "SELECT column_name FROM information_schema.columns WHERE table_schema = \
                 DATABASE() AND table_name = ? ORDER BY ordinal_position",
                (table,),
            )
            .await?;
        Ok(names)
    }
}

fn to_params(params: &[String]) -> Params {
    Params::Positional(params.iter().map(|p| Value::from(p.as_str())).collect())
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        other => Some(other.as_sql(true).trim_matches('\'').to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        assert_eq!(value_to_text(&Value::NULL), None);
        assert_eq!(
            value_to_text(&Value::Bytes(b"hello".to_vec())),
            Some("hello".to_owned())
        );
        assert_eq!(value_to_text(&Value::Int(-3)), Some("-3".to_owned()));
    }

    #[test]
    fn test_values_bind_positionally() {
        // Quote and backslash content stays data, never statement text.
        let params = to_params(&["a".to_owned(), "\\' OR '1'='1".to_owned()]);
        let Params::Positional(values) = params else {
            panic!("expected positional params");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[1], Value::Bytes(b"\\' OR '1'='1".to_vec()));
    }
}
