use metrics::{
    log_counter,
    log_distribution,
    register_convex_counter,
    register_convex_histogram,
};

register_convex_counter!(
    ENTRY_PROCESSOR_SKIPPED_TOTAL,
    "Number of entries skipped as benign (directories slipping past the ignore filter)"
);
register_convex_counter!(
    ENTRY_PROCESSOR_PRECOMPRESSED_TOTAL,
    "Number of entries whose pre-compression attempt was kept"
);
register_convex_counter!(
    ENTRY_PROCESSOR_INJECTED_TOTAL,
    "Number of entries that received an HTML tail injection"
);
register_convex_histogram!(
    ENTRY_PROCESSOR_UPLOAD_BYTES_SECONDS,
    "Wall time spent uploading a single entry"
);

pub fn log_skipped() {
    log_counter(&ENTRY_PROCESSOR_SKIPPED_TOTAL, 1);
}

pub fn log_precompressed() {
    log_counter(&ENTRY_PROCESSOR_PRECOMPRESSED_TOTAL, 1);
}

pub fn log_injected() {
    log_counter(&ENTRY_PROCESSOR_INJECTED_TOTAL, 1);
}

pub fn log_upload_seconds(seconds: f64) {
    log_distribution(&ENTRY_PROCESSOR_UPLOAD_BYTES_SECONDS, seconds);
}
