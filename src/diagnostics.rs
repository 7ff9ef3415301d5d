//! Injected metrics-reporting collaborator.
//!
//! The core never decides where metrics go. Jobs and integrations submit
//! [`MetricSample`]s to a [`MetricsSink`]; the embedding agent chooses the
//! implementation. Two are provided:
//! - [`TracingSink`] - logs every sample as a structured `tracing` event;
//! - [`MemorySink`] - records samples in memory, for tests and dry runs.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Kind of submitted metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Count,
    Gauge,
    Histogram,
}

/// One submitted metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Destination of diagnostic and collected metrics.
pub trait MetricsSink: Send + Sync {
    fn submit(&self, sample: MetricSample);

    fn count(&self, name: &str, value: f64, tags: &[String]) {
        self.submit(sample(MetricKind::Count, name, value, tags));
    }

    fn gauge(&self, name: &str, value: f64, tags: &[String]) {
        self.submit(sample(MetricKind::Gauge, name, value, tags));
    }

    fn histogram(&self, name: &str, value: f64, tags: &[String]) {
        self.submit(sample(MetricKind::Histogram, name, value, tags));
    }
}

fn sample(kind: MetricKind, name: &str, value: f64, tags: &[String]) -> MetricSample {
    MetricSample {
        kind,
        name: name.to_string(),
        value,
        tags: tags.to_vec(),
        timestamp: Utc::now(),
    }
}

/// Emits every sample as a `debug` level tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn submit(&self, sample: MetricSample) {
        debug!(
            kind = ?sample.kind,
            metric = %sample.name,
            value = sample.value,
            tags = ?sample.tags,
            "metric"
        );
    }
}

/// Records submitted samples.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Vec<MetricSample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All samples submitted so far, in submission order.
    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Samples with the given name.
    pub fn named(&self, name: &str) -> Vec<MetricSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Sum of the values submitted under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.named(name).iter().map(|s| s.value).sum()
    }

    pub fn clear(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricsSink for MemorySink {
    fn submit(&self, sample: MetricSample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }
}
