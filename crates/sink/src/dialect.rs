//! SQL dialect specifics. The sink backends differ only in identifier
//! quoting and case handling; every statement the engine issues is built
//! here so the backends stay thin. Identifiers are quoted and spliced into
//! the statement text; values always travel as positional parameters, never
//! as inline literals.

use common::data_type::SqlType;

use crate::{
    Row,
    CONFIGURATION_TABLE,
    DIAGNOSTICS_TABLE,
    TIMESTAMP_COLUMN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MariaDb,
    /// MonetDB folds unquoted identifiers to lowercase; the sink quotes
    /// everything and stores lowercase names to stay consistent.
    MonetDb,
}

impl Dialect {
    pub fn quote_ident(&self, name: &str) -> String {
        let name = self.fold_case(name);
        match self {
            Dialect::Sqlite | Dialect::MonetDb => {
                format!("\"{}\"", name.replace('"', "\"\""))
            },
            Dialect::MariaDb => format!("`{}`", name.replace('`', "``")),
        }
    }

    pub fn fold_case(&self, name: &str) -> String {
        match self {
            Dialect::MonetDb => name.to_lowercase(),
            _ => name.to_owned(),
        }
    }

    pub fn create_diagnostics_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT)",
            self.quote_ident(DIAGNOSTICS_TABLE),
            self.quote_ident(TIMESTAMP_COLUMN),
            self.quote_ident("MESSAGE"),
        )
    }

    pub fn create_configuration_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT)",
            self.quote_ident(CONFIGURATION_TABLE),
            self.quote_ident("ID"),
            self.quote_ident("DATA"),
        )
    }

    /// Per-connection data table: `TIMESTAMP` first, then one typed column
    /// per reader in reader order.
    pub fn create_data_table(&self, table: &str, columns: &[(String, SqlType)]) -> String {
        let mut cols = format!("{} TEXT", self.quote_ident(TIMESTAMP_COLUMN));
        for (name, sql_type) in columns {
            cols.push_str(&format!(", {} {}", self.quote_ident(name), sql_type.as_str()));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({cols})",
            self.quote_ident(table)
        )
    }

    pub fn add_column(&self, table: &str, column: &str, sql_type: SqlType) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote_ident(table),
            self.quote_ident(column),
            sql_type.as_str(),
        )
    }

    /// INSERT aligned to the discovered header order; columns absent from
    /// the row are omitted and default to NULL. Returns the statement and
    /// its positional parameters.
    pub fn insert_row(&self, table: &str, headers: &[String], row: &Row) -> (String, Vec<String>) {
        let mut columns = Vec::new();
        let mut params = Vec::new();
        for header in headers {
            let value = row
                .iter()
                .find(|(k, _)| self.fold_case(k) == *header)
                .map(|(_, v)| v);
            if let Some(value) = value {
                columns.push(self.quote_ident(header));
                params.push(value.clone());
            }
        }
        let placeholders = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.quote_ident(table),
            columns.join(", "),
        );
        (sql, params)
    }

    pub fn insert_diagnostics(&self, timestamp: &str, message: &str) -> (String, Vec<String>) {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            self.quote_ident(DIAGNOSTICS_TABLE),
            self.quote_ident(TIMESTAMP_COLUMN),
            self.quote_ident("MESSAGE"),
        );
        (sql, vec![timestamp.to_owned(), message.to_owned()])
    }

    pub fn insert_configuration(&self, id: &str, data: &str) -> (String, Vec<String>) {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?, ?)",
            self.quote_ident(CONFIGURATION_TABLE),
            self.quote_ident("ID"),
            self.quote_ident("DATA"),
        );
        (sql, vec![id.to_owned(), data.to_owned()])
    }

    pub fn select_configuration(&self) -> String {
        format!(
            "SELECT {}, {} FROM {}",
            self.quote_ident("ID"),
            self.quote_ident("DATA"),
            self.quote_ident(CONFIGURATION_TABLE),
        )
    }

    pub fn clear_configuration(&self) -> String {
        format!("DELETE FROM {}", self.quote_ident(CONFIGURATION_TABLE))
    }

    /// Retention delete. `TIMESTAMP` text sorts lexicographically in the
    /// sink's timestamp format, so a plain comparison is exact.
    pub fn delete_older_than(&self, table: &str, horizon: &str) -> (String, Vec<String>) {
        let sql = format!(
            "DELETE FROM {} WHERE {} < ?",
            self.quote_ident(table),
            self.quote_ident(TIMESTAMP_COLUMN),
        );
        (sql, vec![horizon.to_owned()])
    }
}
