//! Calendar-driven retention: snapshot the sink, then delete rows older
//! than the horizon. Weekly schedules run every `interval` weeks; monthly
//! schedules fire weekly and no-op outside the first week of the month.

use std::{
    sync::Arc,
    time::Duration,
};

use chrono::{
    DateTime,
    Datelike,
    Days,
    NaiveTime,
    Utc,
    Weekday,
};
use common::errors::ErrorMetadata;
use parking_lot::Mutex;
use sink::SqlSink;
use tokio::{
    sync::watch,
    task::JoinHandle,
};

const STOP_GRACE: Duration = Duration::from_secs(5);

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct Archiver {
    sink: Arc<dyn SqlSink>,
    schedule: Mutex<Option<ScheduleHandle>>,
}

struct ScheduleHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Archiver {
    pub fn new(sink: Arc<dyn SqlSink>) -> Self {
        Self {
            sink,
            schedule: Mutex::new(None),
        }
    }

    /// Schedules archiving on `day_of_week` (1 = Monday .. 7 = Sunday), at
    /// the first hour of the day, every `interval` weeks or months.
    /// Overwrites any existing schedule.
    pub fn set_archiving_service(
        &self,
        day_of_week: u8,
        interval: u32,
        use_months: bool,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=7).contains(&day_of_week),
            ErrorMetadata::bad_argument("BadArchiverDay", "day_of_week must be in 1..=7")
        );
        let max_range = if use_months { 12 } else { 52 };
        anyhow::ensure!(
            (1..=max_range).contains(&interval),
            ErrorMetadata::bad_argument(
                "BadArchiverInterval",
                format!("interval must be in 1..={max_range}"),
            )
        );
        anyhow::ensure!(
            self.sink.is_archiver(),
            ErrorMetadata::config_invalid(
                "SinkNotArchiver",
                "this sink does not support snapshots",
            )
        );

        let mut schedule = self.schedule.lock();
        if let Some(previous) = schedule.take() {
            previous.task.abort();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = self.sink.clone();
        let task = tokio::spawn(run_schedule(
            sink,
            day_of_week,
            interval,
            use_months,
            stop_rx,
        ));
        *schedule = Some(ScheduleHandle { stop_tx, task });
        Ok(())
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .lock()
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    pub async fn stop(&self) {
        let handle = self.schedule.lock().take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle.task).await.is_err() {
                tracing::warn!("Archiver did not stop within {STOP_GRACE:?}; aborting");
                abort.abort();
            }
        }
    }
}

async fn run_schedule(
    sink: Arc<dyn SqlSink>,
    day_of_week: u8,
    interval: u32,
    use_months: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    let first = first_fire_time(Utc::now(), day_of_week, use_months);
    let delay = (first - Utc::now())
        .to_std()
        .unwrap_or(Duration::from_secs(0));
    tracing::info!("First archive scheduled for {first}");
    tokio::select! {
        _ = stop_rx.changed() => return,
        _ = tokio::time::sleep(delay) => {},
    }
    // Monthly schedules fire weekly and gate on the month-day below.
    let period = if use_months { WEEK } else { WEEK * interval };
    loop {
        let now = Utc::now();
        if !use_months || now.day() <= 7 {
            archive(&sink, now, use_months).await;
        }
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = tokio::time::sleep(period) => {},
        }
    }
}

async fn archive(sink: &Arc<dyn SqlSink>, now: DateTime<Utc>, use_months: bool) {
    tracing::info!("Archiving the sink");
    if let Err(e) = sink.snapshot(now.date_naive()).await {
        tracing::warn!("Snapshot failed: {e:#}");
        let _ = sink.log(&format!("Snapshot failed: {e:#}"), false).await;
        return;
    }
    let horizon = retention_horizon(now, use_months);
    match sink.delete_older_than(horizon).await {
        Ok(()) => {
            let _ = sink.log("Archive completed", false).await;
        },
        Err(e) => {
            tracing::warn!("Retention delete failed: {e:#}");
            let _ = sink.log(&format!("Retention delete failed: {e:#}"), false).await;
        },
    }
}

/// Next occurrence of `day_of_week` at hour 0; monthly schedules shift
/// forward in whole weeks until they land in the first week of a following
/// month.
pub fn first_fire_time(now: DateTime<Utc>, day_of_week: u8, use_months: bool) -> DateTime<Utc> {
    let mut date = now.date_naive();
    loop {
        let fire = date
            .and_time(NaiveTime::MIN)
            .and_utc();
        if fire > now && weekday_number(date.weekday()) == day_of_week {
            break;
        }
        date = date.checked_add_days(Days::new(1)).expect("date in range");
    }
    if use_months {
        while !(date.month() != now.month() && date.day() <= 7) {
            date = date.checked_add_days(Days::new(7)).expect("date in range");
        }
    }
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Weekly retention keeps one week of data; monthly retention keeps the
/// previous month plus the elapsed part of the current one.
pub fn retention_horizon(now: DateTime<Utc>, use_months: bool) -> DateTime<Utc> {
    let days = if use_months {
        30 + now.day() as u64
    } else {
        7
    };
    now - chrono::Duration::days(days as i64)
}

fn weekday_number(weekday: Weekday) -> u8 {
    weekday.number_from_monday() as u8
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use sink::testing::TestingSink;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_first_fire_weekly() {
        // Sunday 23:00 -> Monday 00:00, one hour later.
        let now = utc(2026, 1, 4, 23, 0);
        assert_eq!(first_fire_time(now, 1, false), utc(2026, 1, 5, 0, 0));

        // Already Monday: the fire time is next Monday.
        let monday_noon = utc(2026, 1, 5, 12, 0);
        assert_eq!(first_fire_time(monday_noon, 1, false), utc(2026, 1, 12, 0, 0));

        // Sunday schedule from a Monday.
        assert_eq!(first_fire_time(monday_noon, 7, false), utc(2026, 1, 11, 0, 0));
    }

    #[test]
    fn test_first_fire_monthly_lands_in_first_week_of_next_month() {
        // Mid-January: the first monthly fire is the first Monday of
        // February.
        let now = utc(2026, 1, 14, 9, 30);
        assert_eq!(first_fire_time(now, 1, true), utc(2026, 2, 2, 0, 0));

        // Late December wraps the year.
        let december = utc(2025, 12, 29, 12, 0);
        assert_eq!(first_fire_time(december, 1, true), utc(2026, 1, 5, 0, 0));
    }

    #[test]
    fn test_retention_horizons() {
        let now = utc(2026, 1, 20, 0, 0);
        assert_eq!(retention_horizon(now, false), utc(2026, 1, 13, 0, 0));
        // Monthly: 30 + 20 days back.
        assert_eq!(retention_horizon(now, true), utc(2025, 12, 1, 0, 0));
    }

    #[test]
    fn test_schedule_validation() {
        let archiver = Archiver::new(Arc::new(TestingSink::new()));
        assert!(archiver.set_archiving_service(0, 1, false).is_err());
        assert!(archiver.set_archiving_service(8, 1, false).is_err());
        assert!(archiver.set_archiving_service(1, 0, false).is_err());
        assert!(archiver.set_archiving_service(1, 53, false).is_err());
        assert!(archiver.set_archiving_service(1, 13, true).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_weekly_schedule_snapshots_and_deletes() -> anyhow::Result<()> {
        let sink = TestingSink::new();
        let archiver = Archiver::new(Arc::new(sink.clone()));
        archiver.set_archiving_service(1, 1, false)?;
        assert!(archiver.is_scheduled());

        // More than a week of virtual time covers the first fire plus one
        // repeat.
        tokio::time::sleep(Duration::from_secs(15 * 24 * 3600)).await;
        archiver.stop().await;
        assert!(!archiver.is_scheduled());

        let snapshots = sink.snapshots();
        let deletes = sink.retention_deletes();
        assert!(!snapshots.is_empty());
        assert_eq!(snapshots.len(), deletes.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_reschedule_overwrites() -> anyhow::Result<()> {
        let archiver = Archiver::new(Arc::new(TestingSink::new()));
        archiver.set_archiving_service(1, 1, false)?;
        archiver.set_archiving_service(2, 4, false)?;
        assert!(archiver.is_scheduled());
        archiver.stop().await;
        Ok(())
    }
}
