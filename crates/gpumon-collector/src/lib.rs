//! GPU metric collector.
//!
//! Samples a fixed catalog of `nvidia-smi` fields on every GPU of the host
//! and publishes them as `gce_instance` time series:
//!
//! - [`SchemaRegistry`] creates one metric descriptor per catalog entry at
//!   startup.
//! - [`Scheduler`] ticks on a fixed interval and, through the
//!   [`Aggregator`], samples every metric once per GPU plus once across
//!   all GPUs.
//! - [`Publisher`] turns each reading into a point and writes it, logging
//!   and dropping failures.
//!
//! [`daemon::run`] wires all of it to the real tool, metadata server and
//! Cloud Monitoring.

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod daemon;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod scheduler;

pub use aggregator::{Aggregator, MetricReport, SlotOutcome};
pub use catalog::{default_catalog, MetricDefinition};
pub use config::{parse_bool, CollectorConfig, ConfigOverrides, ConfigRejection};
pub use daemon::{build_backend, discover, run, Collector};
pub use error::{CollectorError, ConfigError, Result};
pub use publisher::{Publisher, SampleSink};
pub use registry::SchemaRegistry;
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
