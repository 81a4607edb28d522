//! The fixed set of `nvidia-smi` fields gpumon publishes.

use gpumon_monitoring::{MetricKind, ValueType};

/// One catalog entry: an `nvidia-smi` query field and how it is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    /// `--query-gpu` field, e.g. `memory.used`.
    pub name: String,
    pub display_name: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
    /// UCUM unit string.
    pub unit: String,
}

impl MetricDefinition {
    /// An integer gauge, the only shape the catalog uses.
    pub fn gauge(
        name: impl Into<String>,
        display_name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            kind: MetricKind::Gauge,
            value_type: ValueType::Int64,
            unit: unit.into(),
        }
    }

    /// Name used in metric types: dots become underscores.
    pub fn wire_name(&self) -> String {
        self.name.replace('.', "_")
    }

    /// Full metric type under `prefix`, e.g.
    /// `custom.googleapis.com/gpu/memory_used`.
    pub fn metric_type(&self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.wire_name())
    }
}

pub fn default_catalog() -> Vec<MetricDefinition> {
    vec![
        MetricDefinition::gauge("temperature.gpu", "GPU temperature", "1/{degres C}"),
        MetricDefinition::gauge("utilization.gpu", "GPU utilization", "%"),
        MetricDefinition::gauge("utilization.memory", "GPU memory utilization", "%"),
        MetricDefinition::gauge("memory.total", "GPU memory total", "MiBy"),
        MetricDefinition::gauge("memory.free", "GPU memory free", "MiBy"),
        MetricDefinition::gauge("memory.used", "GPU memory used", "MiBy"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_name() {
        let def = MetricDefinition::gauge("utilization.memory", "", "%");
        assert_eq!(def.wire_name(), "utilization_memory");
        assert_eq!(
            def.metric_type("custom.googleapis.com/gpu"),
            "custom.googleapis.com/gpu/utilization_memory"
        );
        assert_eq!(
            def.metric_type("custom.googleapis.com/gpu/"),
            "custom.googleapis.com/gpu/utilization_memory"
        );
    }

    #[test]
    fn test_default_catalog() {
        let catalog = default_catalog();
        let names: Vec<_> = catalog.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "temperature.gpu",
                "utilization.gpu",
                "utilization.memory",
                "memory.total",
                "memory.free",
                "memory.used",
            ]
        );
        assert!(catalog
            .iter()
            .all(|d| d.kind == MetricKind::Gauge && d.value_type == ValueType::Int64));
        assert_eq!(catalog[0].unit, "1/{degres C}");
        assert_eq!(catalog[5].unit, "MiBy");
    }
}
