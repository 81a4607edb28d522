//! Cloud Monitoring v3 resources, as they appear in the REST JSON API.
//!
//! Only the subset gpumon writes is modelled: custom metric descriptors and
//! single-point `gce_instance` time series.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
    Delta,
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bool,
    Int64,
    Double,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabelValueType {
    String,
    Bool,
    Int64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    pub value_type: LabelValueType,
    pub description: String,
}

/// Schema of a custom metric. Must exist before points referencing its
/// `type` can be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub unit: String,
    pub description: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    pub end_time: DateTime<Utc>,
}

/// A point value. The API encodes 64-bit integers as JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    #[serde(rename = "int64Value", with = "int64_string")]
    Int64(i64),
    #[serde(rename = "doubleValue")]
    Double(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub interval: TimeInterval,
    pub value: TypedValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    pub metric: Metric,
    pub resource: MonitoredResource,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub points: Vec<Point>,
}

impl TimeSeries {
    /// Value of a metric label, if this series carries it.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metric.labels.get(key).map(String::as_str)
    }

    /// Value of the first point as an integer.
    pub fn int64_value(&self) -> Option<i64> {
        match self.points.first()?.value {
            TypedValue::Int64(v) => Some(v),
            TypedValue::Double(_) => None,
        }
    }
}

/// Body of `projects.timeSeries.create`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTimeSeriesRequest<'a> {
    pub time_series: &'a [TimeSeries],
}

/// `projects/<project>`, the parent of every request.
pub fn project_name(project_id: &str) -> String {
    format!("projects/{}", project_id)
}

mod int64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Num(i64),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Num(n) => Ok(n),
        }
    }
}
