use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    labels::StaticMetricLabel,
    reporting::{
        log_distribution,
        log_distribution_with_labels,
    },
};

pub struct Timer<T: 'static> {
    start: Instant,
    histogram: &'static T,
    labels: BTreeSet<StaticMetricLabel>,
}

impl Timer<HistogramVec> {
    pub fn new_with_labels(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: BTreeSet::new(),
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.insert(label);
    }

    pub fn remove_label(&mut self, label: StaticMetricLabel) {
        self.labels.remove(&label);
    }

    pub fn replace_label(&mut self, old_label: StaticMetricLabel, new_label: StaticMetricLabel) {
        self.labels.remove(&old_label);
        self.labels.insert(new_label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Timer<Histogram> {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: BTreeSet::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer<Histogram> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        log_distribution(self.histogram, elapsed);
    }
}

impl Drop for Timer<HistogramVec> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(self.histogram, elapsed, labels.into_iter().collect());
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly
/// called upon success.
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct StatusTimer(Timer<HistogramVec>);

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = Timer::new_with_labels(histogram);
        timer.add_label(StaticMetricLabel::STATUS_ERROR);
        Self(timer)
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.0.labels.insert(label);
    }

    pub fn finish(mut self) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::STATUS_SUCCESS,
        );
        self.0.elapsed()
    }

    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::new("status", status),
        );
        self.0.elapsed()
    }
}

/// Timer that defaults to CANCELED, but switches to ERROR/SUCCESS once
/// `.finish()` is called.
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct CancelableTimer(Timer<HistogramVec>);

impl CancelableTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = Timer::new_with_labels(histogram);
        timer.add_label(StaticMetricLabel::STATUS_CANCELED);
        Self(timer)
    }

    pub fn finish(mut self, is_ok: bool) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_CANCELED,
            StaticMetricLabel::status(is_ok),
        );
        self.0.elapsed()
    }

    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_CANCELED,
            StaticMetricLabel::new("status", status),
        );
        self.0.elapsed()
    }
}
