//! Code for interacting with our metrics logging.
use std::sync::LazyLock;

mod labels;
mod macros;
mod metrics;
mod progress;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    progress::ProgressCounter,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        CancelableTimer,
        StatusTimer,
        Timer,
    },
};

/// Reports the service's version as a gauge value of 1, labeled by version
/// string, so dashboards can see which binary versions are live.
pub static SERVER_VERSION_STR: LazyLock<String> = LazyLock::new(|| {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("0.0.0").to_owned();
    CONVEX_BINARY_VERSIONS_TOTAL
        .with_label_values(&[&SERVICE_NAME, &version])
        .set(1.0);
    version
});

register_convex_gauge!(
    CONVEX_BINARY_VERSIONS_TOTAL,
    "Gauge representing the existence of a certain process at a certain version, as indicated in \
     the labels",
    &["binary", "version"]
);
