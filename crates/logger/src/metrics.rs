use std::sync::LazyLock;

use prometheus::{
    IntCounter,
    IntCounterVec,
    Opts,
};

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter opts");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter =
        IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
    let _ = prometheus::default_registry().register(Box::new(counter.clone()));
    counter
}

static TICKS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| register_counter("jidl_scheduler_ticks_total", "Scheduler ticks emitted"));

static ROWS_APPENDED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_counter_vec(
        "jidl_rows_appended_total",
        "Sample rows appended to the sink",
        &["connection"],
    )
});

static READ_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_counter_vec(
        "jidl_read_failures_total",
        "Device read failures",
        &["connection"],
    )
});

pub fn log_tick() {
    TICKS_TOTAL.inc();
}

pub fn log_row_appended(connection: &str) {
    ROWS_APPENDED_TOTAL.with_label_values(&[connection]).inc();
}

pub fn log_read_failure(connection: &str) {
    READ_FAILURES_TOTAL.with_label_values(&[connection]).inc();
}
