//! Turns sampled values into time series points and writes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use gpumon_metadata::InstanceIdentity;
use gpumon_monitoring::{
    Metric, MonitoredResource, MonitoringBackend, MonitoringResult, Point, TimeInterval,
    TimeSeries, TypedValue,
};
use gpumon_smi::UnitSlot;

use crate::catalog::MetricDefinition;
use crate::registry::GPU_ID_LABEL;

pub const RESOURCE_TYPE: &str = "gce_instance";

/// Receives every successful reading of a tick.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Must not fail: whatever goes wrong is handled (logged) inside.
    async fn accept(&self, def: &MetricDefinition, slot: UnitSlot, value: i64);
}

pub struct Publisher {
    backend: Arc<dyn MonitoringBackend>,
    identity: Arc<InstanceIdentity>,
    metric_prefix: String,
    per_unit_labels: bool,
}

impl Publisher {
    pub fn new(
        backend: Arc<dyn MonitoringBackend>,
        identity: Arc<InstanceIdentity>,
        metric_prefix: impl Into<String>,
        per_unit_labels: bool,
    ) -> Self {
        Self {
            backend,
            identity,
            metric_prefix: metric_prefix.into(),
            per_unit_labels,
        }
    }

    /// One single-point series stamped with the current wall-clock time.
    pub fn build_series(&self, value: i64, def: &MetricDefinition, slot: UnitSlot) -> TimeSeries {
        let mut labels = BTreeMap::new();
        if self.per_unit_labels {
            labels.insert(GPU_ID_LABEL.to_string(), slot.label());
        }

        TimeSeries {
            metric: Metric {
                metric_type: def.metric_type(&self.metric_prefix),
                labels,
            },
            resource: MonitoredResource {
                resource_type: RESOURCE_TYPE.to_string(),
                labels: self.identity.resource_labels(),
            },
            metric_kind: def.kind,
            value_type: def.value_type,
            points: vec![Point {
                interval: TimeInterval {
                    end_time: Utc::now(),
                },
                value: TypedValue::Int64(value),
            }],
        }
    }

    /// Write one point. No retry.
    pub async fn publish(
        &self,
        value: i64,
        def: &MetricDefinition,
        slot: UnitSlot,
    ) -> MonitoringResult<()> {
        let series = self.build_series(value, def, slot);
        self.backend
            .create_time_series(&self.identity.project_id, std::slice::from_ref(&series))
            .await
    }
}

#[async_trait]
impl SampleSink for Publisher {
    async fn accept(&self, def: &MetricDefinition, slot: UnitSlot, value: i64) {
        match self.publish(value, def, slot).await {
            Ok(()) => {
                tracing::debug!(metric = %def.name, slot = %slot, value, "Point published");
            }
            Err(e) => {
                tracing::warn!(metric = %def.name, slot = %slot, error = %e, "Failed to publish point");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpumon_monitoring::{InMemoryBackend, MetricKind, ValueType};

    fn publisher(backend: Arc<InMemoryBackend>, per_unit: bool) -> Publisher {
        Publisher::new(
            backend,
            Arc::new(InstanceIdentity::new("my-project", "us-central1-a", "4242")),
            "custom.googleapis.com/gpu",
            per_unit,
        )
    }

    #[test]
    fn test_build_series() {
        let publisher = publisher(Arc::new(InMemoryBackend::new()), true);
        let def = MetricDefinition::gauge("memory.used", "GPU memory used", "MiBy");

        let before = Utc::now();
        let series = publisher.build_series(2048, &def, UnitSlot::Unit(1));

        assert_eq!(series.metric.metric_type, "custom.googleapis.com/gpu/memory_used");
        assert_eq!(series.label("gpu_id"), Some("gpu_1"));
        assert_eq!(series.resource.resource_type, "gce_instance");
        assert_eq!(series.resource.labels["project_id"], "my-project");
        assert_eq!(series.resource.labels["zone"], "us-central1-a");
        assert_eq!(series.resource.labels["instance_id"], "4242");
        assert_eq!(series.metric_kind, MetricKind::Gauge);
        assert_eq!(series.value_type, ValueType::Int64);
        assert_eq!(series.int64_value(), Some(2048));
        assert!(series.points[0].interval.end_time >= before);
    }

    #[test]
    fn test_aggregate_label() {
        let publisher = publisher(Arc::new(InMemoryBackend::new()), true);
        let def = MetricDefinition::gauge("utilization.gpu", "GPU utilization", "%");
        let series = publisher.build_series(15, &def, UnitSlot::Aggregate);
        assert_eq!(series.label("gpu_id"), Some("avg"));
    }

    #[test]
    fn test_aggregate_only_mode_has_no_labels() {
        let publisher = publisher(Arc::new(InMemoryBackend::new()), false);
        let def = MetricDefinition::gauge("utilization.gpu", "GPU utilization", "%");
        let series = publisher.build_series(15, &def, UnitSlot::Aggregate);
        assert!(series.metric.labels.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_metric("custom.googleapis.com/gpu/memory_used");
        let publisher = publisher(backend.clone(), true);
        let used = MetricDefinition::gauge("memory.used", "GPU memory used", "MiBy");
        let free = MetricDefinition::gauge("memory.free", "GPU memory free", "MiBy");

        assert!(publisher.publish(1, &used, UnitSlot::Unit(0)).await.is_err());
        publisher.accept(&used, UnitSlot::Unit(0), 1).await;
        publisher.accept(&free, UnitSlot::Unit(0), 2).await;

        let series = backend.take_series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric.metric_type, "custom.googleapis.com/gpu/memory_free");
    }
}
