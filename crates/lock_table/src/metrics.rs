use metrics::{
    log_counter_with_labels,
    log_gauge_with_labels,
    register_convex_counter,
    register_convex_gauge,
    StaticMetricLabel,
};

register_convex_counter!(
    LOCK_TABLE_CONTENTION_TOTAL,
    "Number of try_lock calls that found the fingerprint already held",
    &["table"]
);
register_convex_gauge!(
    LOCK_TABLE_ACTIVE_ENTRIES_INFO,
    "Number of fingerprints currently held",
    &["table"]
);

pub fn log_contention(table: &'static str) {
    log_counter_with_labels(
        &LOCK_TABLE_CONTENTION_TOTAL,
        1,
        vec![StaticMetricLabel::new("table", table)],
    );
}

pub fn set_active_entries(table: &'static str, count: usize) {
    log_gauge_with_labels(
        &LOCK_TABLE_ACTIVE_ENTRIES_INFO,
        count as f64,
        vec![StaticMetricLabel::new("table", table)],
    );
}
