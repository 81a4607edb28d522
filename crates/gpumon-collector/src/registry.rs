use std::sync::Arc;

use gpumon_monitoring::{LabelDescriptor, LabelValueType, MetricDescriptor, MonitoringBackend};

use crate::catalog::MetricDefinition;
use crate::error::{CollectorError, Result};

pub const GPU_ID_LABEL: &str = "gpu_id";

/// Makes sure every catalog metric has a descriptor before points are
/// written. Runs once at startup.
pub struct SchemaRegistry {
    backend: Arc<dyn MonitoringBackend>,
    project_id: String,
    metric_prefix: String,
    per_unit_labels: bool,
}

impl SchemaRegistry {
    pub fn new(
        backend: Arc<dyn MonitoringBackend>,
        project_id: impl Into<String>,
        metric_prefix: impl Into<String>,
        per_unit_labels: bool,
    ) -> Self {
        Self {
            backend,
            project_id: project_id.into(),
            metric_prefix: metric_prefix.into(),
            per_unit_labels,
        }
    }

    pub fn descriptor(&self, def: &MetricDefinition) -> MetricDescriptor {
        let wire = def.wire_name();
        let labels = if self.per_unit_labels {
            vec![LabelDescriptor {
                key: GPU_ID_LABEL.to_string(),
                value_type: LabelValueType::String,
                description: format!("related gpu_id for {} metric", wire),
            }]
        } else {
            Vec::new()
        };

        MetricDescriptor {
            name: wire.clone(),
            metric_type: def.metric_type(&self.metric_prefix),
            metric_kind: def.kind,
            value_type: def.value_type,
            unit: def.unit.clone(),
            description: format!("gpumon metric for {} nvidia-smi query", wire),
            display_name: def.display_name.clone(),
            labels,
        }
    }

    /// Create one descriptor per definition, in catalog order. The first
    /// failure aborts; descriptors created before it are left in place.
    pub async fn register_all(&self, catalog: &[MetricDefinition]) -> Result<()> {
        for def in catalog {
            let descriptor = self.descriptor(def);
            self.backend
                .create_metric_descriptor(&self.project_id, &descriptor)
                .await
                .map_err(|source| CollectorError::Registration {
                    metric_type: descriptor.metric_type.clone(),
                    source,
                })?;
            tracing::info!(metric_type = %descriptor.metric_type, "Metric descriptor registered");
        }
        Ok(())
    }
}
