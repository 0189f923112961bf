use metrics::register_convex_counter;

register_convex_counter!(
    pub CLASSIFIED_ERROR_TOTAL,
    "Count of classified errors by short_msg",
    &["short_msg"]
);

pub fn log_classified_error(short_msg: &str) {
    CLASSIFIED_ERROR_TOTAL
        .with_label_values(&[short_msg])
        .inc();
}
