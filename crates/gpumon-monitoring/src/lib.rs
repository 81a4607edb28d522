//! Monitoring backend for gpumon.
//!
//! Holds the Cloud Monitoring resource model gpumon writes (metric
//! descriptors and `gce_instance` time series), the [`MonitoringBackend`]
//! trait the collector publishes through, and its implementations:
//!
//! - [`RestBackend`]: the real API, authenticated by a [`TokenProvider`].
//! - [`LogBackend`]: logs via `tracing`, used by `--dry-run`.
//! - [`InMemoryBackend`]: stores everything, used by tests.

pub mod auth;
pub mod backend;
pub mod error;
pub mod model;
pub mod rest;

pub use auth::{
    load_credentials_file, FileTokenProvider, ServiceAccountTokenProvider, StaticTokenProvider,
    TokenCache, TokenProvider, DEFAULT_TOKEN_URI, MONITORING_WRITE_SCOPE,
};
pub use backend::{InMemoryBackend, LogBackend, MonitoringBackend};
pub use error::{MonitoringError, MonitoringResult};
pub use model::{
    project_name, LabelDescriptor, LabelValueType, Metric, MetricDescriptor, MetricKind,
    MonitoredResource, Point, TimeInterval, TimeSeries, TypedValue, ValueType,
};
pub use rest::{RestBackend, DEFAULT_ENDPOINT};
