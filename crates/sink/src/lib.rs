//! The logging sink contract: append-only row storage per connection, a
//! diagnostics table, and a persisted copy of the configuration.
//!
//! Concrete relational backends plug in through [`SqlConnection`]; the
//! [`SqlSink`] trait is what the rest of the engine sees. The sink is chosen
//! once at configuration time and handed around as `Arc<dyn SqlSink>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{
    DateTime,
    Duration,
    NaiveDate,
    Utc,
};
use common::ini::IniSection;

pub mod dialect;
mod dummy;
mod relational;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dialect::Dialect;
pub use dummy::DummySink;
pub use relational::{
    RelationalSink,
    SqlConnection,
};

pub const DIAGNOSTICS_TABLE: &str = "JIDL Diagnostics";
pub const CONFIGURATION_TABLE: &str = "JIDL Configuration";
pub const TIMESTAMP_COLUMN: &str = "TIMESTAMP";

/// One sample row: tag name → insert text, plus the `TIMESTAMP` key.
pub type Row = BTreeMap<String, String>;

/// Timestamp format used for every `TIMESTAMP` column. Millisecond
/// precision keeps the diagnostics primary key collision-free at the rates
/// the scheduler logs at; the one collision case left is retried with
/// [`bump_timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn bump_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts + Duration::milliseconds(1)
}

#[async_trait]
pub trait SqlSink: Send + Sync + 'static {
    /// Acquires the underlying store handle, ensures the diagnostics and
    /// configuration tables exist, and discovers the headers of every user
    /// table in declaration order.
    async fn open(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    /// Discovered column order for a user table, if it exists.
    fn headers(&self, table: &str) -> Option<Vec<String>>;

    /// Creates (or extends) the per-connection table: `TIMESTAMP TEXT`
    /// first, then one column per reader in reader order.
    async fn create_data_table(
        &self,
        table: &str,
        columns: &[(String, common::data_type::SqlType)],
    ) -> anyhow::Result<()>;

    /// Inserts one sample row. Columns absent from `row` are omitted from
    /// the INSERT and default to NULL.
    async fn add_entry(&self, table: &str, row: &Row) -> anyhow::Result<()>;

    /// Inserts one diagnostics row with a generated timestamp. A failed
    /// insert with `is_error` set is the fatal `SinkUnavailable` signal.
    async fn log(&self, message: &str, is_error: bool) -> anyhow::Result<()>;

    async fn get_configuration(&self) -> anyhow::Result<Vec<IniSection>>;

    async fn store_configuration(&self, sections: &[IniSection]) -> anyhow::Result<()>;

    /// Retention delete over every user table plus diagnostics.
    async fn delete_older_than(&self, horizon: DateTime<Utc>) -> anyhow::Result<()>;

    /// Sink-specific backup named after the given date.
    async fn snapshot(&self, date: NaiveDate) -> anyhow::Result<()>;

    /// Whether this sink supports snapshots; the archiver is disabled
    /// otherwise.
    fn is_archiver(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()
            + Duration::milliseconds(42);
        assert_eq!(format_timestamp(ts), "2026-01-05 10:00:00,042");
        assert_eq!(format_timestamp(bump_timestamp(ts)), "2026-01-05 10:00:00,043");
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let base = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let mut formatted: Vec<String> = (0..1200)
            .map(|i| format_timestamp(base + Duration::milliseconds(7 * i)))
            .collect();
        let sorted = formatted.clone();
        formatted.sort();
        assert_eq!(formatted, sorted);
    }
}
