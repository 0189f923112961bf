use metrics::{
    log_counter,
    log_counter_with_labels,
    register_convex_counter,
    register_convex_histogram,
    StaticMetricLabel,
    StatusTimer,
};

register_convex_histogram!(
    JOB_COORDINATOR_EXTRACT_SECONDS,
    "Wall time of one extraction job, from lock acquisition to finalization",
    &["status"]
);
register_convex_counter!(
    JOB_COORDINATOR_CONTENTION_TOTAL,
    "Number of extract requests that found their fingerprint already locked"
);
register_convex_counter!(
    JOB_COORDINATOR_ROLLBACK_FAILURES_TOTAL,
    "Number of compensating deletes that themselves failed during rollback"
);
register_convex_counter!(
    JOB_COORDINATOR_CALLBACK_FAILURES_TOTAL,
    "Number of async callback POSTs that failed or returned a non-2xx status",
    &["reason"]
);

pub fn extract_timer() -> StatusTimer {
    StatusTimer::new(&JOB_COORDINATOR_EXTRACT_SECONDS)
}

pub fn log_contention() {
    log_counter(&JOB_COORDINATOR_CONTENTION_TOTAL, 1);
}

pub fn log_rollback_failure() {
    log_counter(&JOB_COORDINATOR_ROLLBACK_FAILURES_TOTAL, 1);
}

pub fn log_callback_failure(reason: &'static str) {
    log_counter_with_labels(
        &JOB_COORDINATOR_CALLBACK_FAILURES_TOTAL,
        1,
        vec![StaticMetricLabel::new("reason", reason)],
    );
}
