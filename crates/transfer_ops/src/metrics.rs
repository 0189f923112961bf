use metrics::{
    log_counter,
    log_counter_with_labels,
    register_convex_counter,
    register_convex_histogram,
    StaticMetricLabel,
    StatusTimer,
};

register_convex_histogram!(
    TRANSFER_OPS_COPY_SECONDS,
    "Time to stream-copy one object between storage locations",
    &["status"]
);
register_convex_histogram!(
    TRANSFER_OPS_SLURP_SECONDS,
    "Time to ingest a URL and upload it to a destination",
    &["status"]
);
register_convex_counter!(
    TRANSFER_OPS_CONTENTION_TOTAL,
    "Number of copy/delete/list/slurp requests that found their fingerprint already locked",
    &["op"]
);
register_convex_counter!(
    TRANSFER_OPS_LIST_FAST_PATH_TOTAL,
    "Number of archive listings served from the get-range fast path vs. a full fetch",
    &["outcome"]
);
register_convex_counter!(
    TRANSFER_OPS_DELETE_FAILURES_TOTAL,
    "Number of keys that failed to delete in a best-effort delete_many call"
);

pub fn copy_timer() -> StatusTimer {
    StatusTimer::new(&TRANSFER_OPS_COPY_SECONDS)
}

pub fn slurp_timer() -> StatusTimer {
    StatusTimer::new(&TRANSFER_OPS_SLURP_SECONDS)
}

pub fn log_contention(op: &'static str) {
    log_counter_with_labels(&TRANSFER_OPS_CONTENTION_TOTAL, 1, vec![StaticMetricLabel::new("op", op)]);
}

pub fn log_list_fast_path(used: bool) {
    let outcome = if used { "fast_path" } else { "full_fetch" };
    log_counter_with_labels(
        &TRANSFER_OPS_LIST_FAST_PATH_TOTAL,
        1,
        vec![StaticMetricLabel::new("outcome", outcome)],
    );
}

pub fn log_delete_failure() {
    log_counter(&TRANSFER_OPS_DELETE_FAILURES_TOTAL, 1);
}
