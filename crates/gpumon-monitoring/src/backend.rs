//! Monitoring backends.
//!
//! - [`RestBackend`](crate::rest::RestBackend): Cloud Monitoring v3 over HTTPS.
//! - [`LogBackend`]: logs descriptors and points via `tracing` (dry runs).
//! - [`InMemoryBackend`]: records everything, for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{MonitoringError, MonitoringResult};
use crate::model::{MetricDescriptor, TimeSeries};

/// The two write calls gpumon makes against the monitoring API.
#[async_trait]
pub trait MonitoringBackend: Send + Sync {
    /// Create a metric descriptor. Creating one that already exists must
    /// succeed.
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> MonitoringResult<()>;

    /// Write points for one or more time series.
    async fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> MonitoringResult<()>;
}

/// Logs instead of sending.
pub struct LogBackend;

#[async_trait]
impl MonitoringBackend for LogBackend {
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> MonitoringResult<()> {
        tracing::info!(
            project_id,
            metric_type = %descriptor.metric_type,
            unit = %descriptor.unit,
            labels = descriptor.labels.len(),
            "metric descriptor (dry run)"
        );
        Ok(())
    }

    async fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> MonitoringResult<()> {
        for ts in series {
            tracing::info!(
                project_id,
                metric_type = %ts.metric.metric_type,
                labels = ?ts.metric.labels,
                value = ?ts.int64_value(),
                "time series point (dry run)"
            );
        }
        Ok(())
    }
}

/// Stores descriptors and points in memory for testing and inspection.
#[derive(Default)]
pub struct InMemoryBackend {
    descriptors: Mutex<BTreeMap<String, MetricDescriptor>>,
    descriptor_calls: AtomicUsize,
    series: Mutex<Vec<TimeSeries>>,
    failing: Mutex<HashSet<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every descriptor and point whose type is `metric_type`.
    pub fn fail_metric(&self, metric_type: impl Into<String>) {
        self.failing.lock().insert(metric_type.into());
    }

    fn check(&self, metric_type: &str) -> MonitoringResult<()> {
        if self.failing.lock().contains(metric_type) {
            return Err(MonitoringError::Rejected(metric_type.to_string()));
        }
        Ok(())
    }

    /// Registered descriptors keyed by metric type.
    pub fn descriptors(&self) -> BTreeMap<String, MetricDescriptor> {
        self.descriptors.lock().clone()
    }

    /// Number of create-descriptor calls, including repeats and failures.
    pub fn descriptor_calls(&self) -> usize {
        self.descriptor_calls.load(Ordering::Relaxed)
    }

    /// Take all stored series, leaving the internal buffer empty.
    pub fn take_series(&self) -> Vec<TimeSeries> {
        std::mem::take(&mut *self.series.lock())
    }

}

#[async_trait]
impl MonitoringBackend for InMemoryBackend {
    async fn create_metric_descriptor(
        &self,
        _project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> MonitoringResult<()> {
        self.descriptor_calls.fetch_add(1, Ordering::Relaxed);
        self.check(&descriptor.metric_type)?;
        self.descriptors
            .lock()
            .insert(descriptor.metric_type.clone(), descriptor.clone());
        Ok(())
    }

    async fn create_time_series(
        &self,
        _project_id: &str,
        series: &[TimeSeries],
    ) -> MonitoringResult<()> {
        for ts in series {
            self.check(&ts.metric.metric_type)?;
        }
        self.series.lock().extend(series.iter().cloned());
        Ok(())
    }
}
