//! Startup sequence and wiring of the collector daemon.
//!
//! Order matters: the tool is probed before anything else so a host
//! without a driver fails fast, and descriptors are registered before
//! the first tick so no point references a missing metric type.

use std::num::NonZeroU32;
use std::sync::Arc;

use gpumon_app::Shutdown;
use gpumon_metadata::{InstanceIdentity, MetadataClient, MetadataTokenProvider};
use gpumon_monitoring::{
    load_credentials_file, LogBackend, MonitoringBackend, RestBackend, TokenProvider,
};
use gpumon_smi::{ProcessRunner, Sampler};

use crate::aggregator::Aggregator;
use crate::catalog::{default_catalog, MetricDefinition};
use crate::config::CollectorConfig;
use crate::error::{CollectorError, Result};
use crate::publisher::Publisher;
use crate::registry::SchemaRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Check the tool, optionally enable persistence mode, and count GPUs.
pub async fn discover(sampler: &Sampler, enable_persistence_mode: bool) -> Result<NonZeroU32> {
    sampler
        .probe()
        .await
        .map_err(CollectorError::ToolUnavailable)?;
    tracing::info!("nvidia-smi detected");

    if enable_persistence_mode {
        match sampler.enable_persistence_mode().await {
            Ok(()) => tracing::info!("nvidia-smi persistence mode enabled"),
            Err(e) => tracing::warn!(error = %e, "Failed to enable persistence mode"),
        }
    }

    let unit_count = sampler.unit_count().await?;
    tracing::info!(units = unit_count.get(), "GPUs detected");

    for unit in 0..unit_count.get() {
        match sampler.bus_id(unit).await {
            Ok(bus_id) => tracing::info!(unit, %bus_id, "GPU"),
            Err(e) => tracing::warn!(unit, error = %e, "Failed to read GPU bus id"),
        }
    }

    Ok(unit_count)
}

/// Pick the monitoring backend for `config`: the REST API, or a logging
/// stand-in for dry runs. A credentials file is read once here so a bad
/// path or key stops startup.
pub async fn build_backend(
    config: &CollectorConfig,
    metadata: &MetadataClient,
) -> Result<Arc<dyn MonitoringBackend>> {
    if config.dry_run {
        tracing::info!("Dry run: descriptors and points are logged, not sent");
        return Ok(Arc::new(LogBackend));
    }

    let tokens: Arc<dyn TokenProvider> = match config.service_account_path {
        Some(ref path) => load_credentials_file(path, config.request_timeout()).await?,
        None => {
            tracing::info!("Using metadata server credentials");
            Arc::new(MetadataTokenProvider::new(metadata.clone()))
        }
    };

    let backend = RestBackend::new(
        config.monitoring_endpoint.clone(),
        tokens,
        config.request_timeout(),
    )?;
    Ok(Arc::new(backend))
}

/// A collector that has finished startup and is ready to tick.
pub struct Collector {
    scheduler: Scheduler,
    identity: Arc<InstanceIdentity>,
}

impl Collector {
    /// Register every descriptor, then assemble the pipeline.
    pub async fn start(
        config: &CollectorConfig,
        sampler: Sampler,
        unit_count: NonZeroU32,
        identity: InstanceIdentity,
        backend: Arc<dyn MonitoringBackend>,
        catalog: Vec<MetricDefinition>,
    ) -> Result<Self> {
        let identity = Arc::new(identity);

        SchemaRegistry::new(
            backend.clone(),
            identity.project_id.clone(),
            config.metric_prefix.clone(),
            config.per_unit_labels,
        )
        .register_all(&catalog)
        .await?;

        let publisher = Arc::new(Publisher::new(
            backend,
            identity.clone(),
            config.metric_prefix.clone(),
            config.per_unit_labels,
        ));
        let aggregator = Aggregator::new(sampler, publisher, unit_count, config.per_unit_labels);
        let scheduler = Scheduler::new(
            aggregator,
            catalog,
            SchedulerConfig {
                interval: config.interval(),
                tick_timeout: config.tick_timeout(),
                shutdown_grace: config.shutdown_grace(),
            },
        );

        Ok(Self {
            scheduler,
            identity,
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn run(&self, shutdown: Shutdown) -> u64 {
        self.scheduler.run(shutdown).await
    }
}

/// Run the daemon with real `nvidia-smi`, metadata server and backend
/// until `shutdown` fires. Every error returned is a startup failure; once
/// collection runs, failures are logged per slot and per point.
pub async fn run(config: CollectorConfig, shutdown: Shutdown) -> Result<()> {
    let runner = ProcessRunner::new(config.smi_path.clone(), config.command_timeout());
    let sampler = Sampler::new(Arc::new(runner));

    let unit_count = discover(&sampler, config.enable_persistence_mode).await?;

    let metadata = MetadataClient::new(config.metadata_url.clone(), config.request_timeout())?;
    let identity = metadata.identity().await?;
    tracing::info!(%identity, "Instance identity resolved");

    let backend = build_backend(&config, &metadata).await?;
    let collector = Collector::start(
        &config,
        sampler,
        unit_count,
        identity,
        backend,
        default_catalog(),
    )
    .await?;

    collector.run(shutdown).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpumon_monitoring::{InMemoryBackend, MonitoringError};
    use gpumon_smi::{ScriptedRunner, SmiError};
    use std::time::Duration;

    fn index_args() -> Vec<String> {
        ["--query-gpu=index", "-u", "--format=csv,noheader"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn bus_args(unit: u32) -> Vec<String> {
        vec![
            "--query-gpu=pci.bus_id".to_string(),
            format!("--id={}", unit),
            "-u".to_string(),
            "--format=csv,noheader".to_string(),
        ]
    }

    #[tokio::test]
    async fn test_discover() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(["--list-gpus"], "GPU 0: Tesla T4\nGPU 1: Tesla T4\n")
                .respond(["-pm", "1"], "Enabled persistence mode\n")
                .respond(index_args(), "0\n1\n")
                .respond(bus_args(0), "00000000:00:04.0\n")
                .fail(bus_args(1), "exit status: 6"),
        );
        let sampler = Sampler::new(runner.clone());

        let units = discover(&sampler, true).await.unwrap();

        assert_eq!(units.get(), 2);
        let calls = runner.calls();
        assert_eq!(calls[0], vec!["--list-gpus".to_string()]);
        assert_eq!(calls[1], vec!["-pm".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_tool_is_fatal() {
        let runner = Arc::new(ScriptedRunner::new().fail(["--list-gpus"], "No such file or directory"));
        let err = discover(&Sampler::new(runner), false).await.unwrap_err();
        assert!(matches!(err, CollectorError::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_unit_count_query_is_fatal() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(["--list-gpus"], "GPU 0: Tesla T4\n")
                .fail(index_args(), "exit status: 9: NVML driver mismatch"),
        );
        let err = discover(&Sampler::new(runner), false).await.unwrap_err();
        assert!(matches!(
            err,
            CollectorError::Smi(SmiError::ToolInvocation { .. })
        ));
        assert!(err.to_string().contains("--query-gpu=index"));
    }

    #[tokio::test]
    async fn test_zero_units_is_fatal() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(["--list-gpus"], "")
                .respond(index_args(), ""),
        );
        let err = discover(&Sampler::new(runner), false).await.unwrap_err();
        assert!(matches!(err, CollectorError::Smi(SmiError::NoUnits)));
    }

    #[tokio::test]
    async fn test_persistence_mode_failure_is_not_fatal() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(["--list-gpus"], "GPU 0: Tesla T4\n")
                .fail(["-pm", "1"], "Insufficient Permissions")
                .respond(index_args(), "0\n")
                .respond(bus_args(0), "00000000:00:04.0\n"),
        );
        assert_eq!(discover(&Sampler::new(runner), true).await.unwrap().get(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_uses_log_backend_without_credentials() {
        let config = CollectorConfig {
            dry_run: true,
            service_account_path: Some("/nonexistent/token.json".into()),
            ..Default::default()
        };
        let metadata =
            MetadataClient::new("http://127.0.0.1:1/", Duration::from_millis(100)).unwrap();
        assert!(build_backend(&config, &metadata).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_credentials_file_is_fatal() {
        let config = CollectorConfig {
            service_account_path: Some("/nonexistent/token.json".into()),
            ..Default::default()
        };
        let metadata =
            MetadataClient::new("http://127.0.0.1:1/", Duration::from_millis(100)).unwrap();
        let err = match build_backend(&config, &metadata).await {
            Ok(_) => panic!("expected a credentials error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            CollectorError::Monitoring(MonitoringError::Credentials { .. })
        ));
    }

    #[tokio::test]
    async fn test_service_account_key_selects_rest_backend() {
        let dir = std::env::temp_dir().join("gpumon-test-daemon");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sa-key.json");
        let key = serde_json::json!({
            "type": "service_account",
            "private_key": include_str!("../../gpumon-monitoring/testdata/test-key.pem"),
            "client_email": "gpumon@my-project.iam.gserviceaccount.com",
        });
        std::fs::write(&path, key.to_string()).unwrap();

        let config = CollectorConfig {
            service_account_path: Some(path.clone()),
            ..Default::default()
        };
        let metadata =
            MetadataClient::new("http://127.0.0.1:1/", Duration::from_millis(100)).unwrap();
        assert!(build_backend(&config, &metadata).await.is_ok());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_registration_failure_stops_start() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_metric("custom.googleapis.com/gpu/temperature_gpu");
        let sampler = Sampler::new(Arc::new(ScriptedRunner::new()));

        let result = Collector::start(
            &CollectorConfig::default(),
            sampler,
            NonZeroU32::new(1).unwrap(),
            InstanceIdentity::new("p", "z", "i"),
            backend,
            default_catalog(),
        )
        .await;

        match result {
            Err(CollectorError::Registration { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("start should fail"),
        }
    }
}
