//! Configuration for the collector daemon.
//!
//! One [`CollectorConfig`] is built at startup by layering, lowest first:
//! built-in defaults, an optional TOML file, `GGM_*` environment variables,
//! and command-line flags. Values that cannot be used are not errors: each
//! is recorded as a [`ConfigRejection`] and the lower layer's value is kept.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpumon_logging::LogConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_METRICS_INTERVAL: &str = "GGM_METRICS_INTERVAL";
pub const ENV_SERVICE_ACCOUNT_PATH: &str = "GGM_SERVICE_ACCOUNT_PATH";
pub const ENV_ENABLE_NVIDIASMI_PM: &str = "GGM_ENABLE_NVIDIASMI_PM";

pub const MIN_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Seconds between collection ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Upper bound on one tick's sampling tasks. Defaults to the interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_timeout_secs: Option<u64>,

    /// JSON file holding an OAuth2 `access_token`. Without it the metadata
    /// server's default service account is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_path: Option<PathBuf>,

    /// Run `nvidia-smi -pm 1` before discovery.
    #[serde(default)]
    pub enable_persistence_mode: bool,

    #[serde(default = "default_smi_path")]
    pub smi_path: PathBuf,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Label every point with `gpu_id` and sample each GPU. When false only
    /// the host-wide average is published, without labels.
    #[serde(default = "default_true")]
    pub per_unit_labels: bool,

    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    #[serde(default = "default_monitoring_endpoint")]
    pub monitoring_endpoint: String,

    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Log descriptors and points instead of sending them.
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_smi_path() -> PathBuf {
    PathBuf::from("nvidia-smi")
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_metric_prefix() -> String {
    "custom.googleapis.com/gpu".to_string()
}

fn default_monitoring_endpoint() -> String {
    gpumon_monitoring::DEFAULT_ENDPOINT.to_string()
}

fn default_metadata_url() -> String {
    gpumon_metadata::DEFAULT_METADATA_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            tick_timeout_secs: None,
            service_account_path: None,
            enable_persistence_mode: false,
            smi_path: default_smi_path(),
            command_timeout_secs: default_command_timeout_secs(),
            per_unit_labels: true,
            metric_prefix: default_metric_prefix(),
            monitoring_endpoint: default_monitoring_endpoint(),
            metadata_url: default_metadata_url(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            dry_run: false,
            log: LogConfig::default(),
        }
    }
}

/// A configuration value that was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRejection {
    /// Where the value came from: an env var, a flag or `config file`.
    pub source: String,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.source, self.value, self.reason)
    }
}

/// Values given on the command line. `None` leaves lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub interval_secs: Option<u64>,
    pub service_account_path: Option<PathBuf>,
    pub enable_persistence_mode: Option<bool>,
    pub dry_run: bool,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub json_logs: bool,
}

/// Boolean spellings accepted in the environment and on the command line.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl CollectorConfig {
    /// Read a TOML file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the effective configuration from every layer.
    ///
    /// `env` looks up one environment variable; pass
    /// `|key| std::env::var(key).ok()` in production.
    pub fn resolve<F>(
        file: Option<&Path>,
        env: F,
        overrides: &ConfigOverrides,
    ) -> Result<(Self, Vec<ConfigRejection>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let mut rejections = Vec::new();

        if config.interval_secs < MIN_INTERVAL_SECS {
            rejections.push(below_minimum("config file", config.interval_secs));
            config.interval_secs = MIN_INTERVAL_SECS;
        }

        config.apply_env(env, &mut rejections);
        config.apply_overrides(overrides, &mut rejections);
        config.validate()?;

        Ok((config, rejections))
    }

    fn apply_env<F>(&mut self, env: F, rejections: &mut Vec<ConfigRejection>)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env(ENV_SERVICE_ACCOUNT_PATH).filter(|v| !v.is_empty()) {
            self.service_account_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = env(ENV_METRICS_INTERVAL).filter(|v| !v.is_empty()) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs >= MIN_INTERVAL_SECS => self.interval_secs = secs,
                Ok(secs) => {
                    rejections.push(below_minimum(ENV_METRICS_INTERVAL, secs));
                    self.interval_secs = MIN_INTERVAL_SECS;
                }
                Err(_) => rejections.push(ConfigRejection {
                    source: ENV_METRICS_INTERVAL.to_string(),
                    value: raw,
                    reason: format!(
                        "not a number of seconds, keeping {}",
                        self.interval_secs
                    ),
                }),
            }
        }

        if let Some(raw) = env(ENV_ENABLE_NVIDIASMI_PM).filter(|v| !v.is_empty()) {
            match parse_bool(&raw) {
                Some(enabled) => self.enable_persistence_mode = enabled,
                None => rejections.push(ConfigRejection {
                    source: ENV_ENABLE_NVIDIASMI_PM.to_string(),
                    value: raw,
                    reason: format!(
                        "not a boolean, keeping {}",
                        self.enable_persistence_mode
                    ),
                }),
            }
        }
    }

    fn apply_overrides(
        &mut self,
        overrides: &ConfigOverrides,
        rejections: &mut Vec<ConfigRejection>,
    ) {
        if let Some(secs) = overrides.interval_secs {
            if secs < MIN_INTERVAL_SECS {
                rejections.push(below_minimum("--metrics-interval", secs));
                self.interval_secs = MIN_INTERVAL_SECS;
            } else {
                self.interval_secs = secs;
            }
        }
        if let Some(ref path) = overrides.service_account_path {
            self.service_account_path = Some(path.clone());
        }
        if let Some(enabled) = overrides.enable_persistence_mode {
            self.enable_persistence_mode = enabled;
        }
        if overrides.dry_run {
            self.dry_run = true;
        }
        if let Some(ref level) = overrides.log_level {
            self.log.level = level.clone();
        }
        if let Some(ref dir) = overrides.log_dir {
            self.log.log_dir = Some(dir.clone());
        }
        if overrides.json_logs {
            self.log.json_format = true;
        }
    }

    /// Reject values no layer can sensibly fall back from.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smi_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("smi_path must not be empty".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.tick_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "tick_timeout_secs must be at least 1".into(),
            ));
        }
        if self.metric_prefix.trim_end_matches('/').is_empty() {
            return Err(ConfigError::Invalid("metric_prefix must not be empty".into()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_INTERVAL_SECS))
    }

    pub fn tick_timeout(&self) -> Duration {
        self.tick_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.interval())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// The configuration as a TOML document, for `--dump-default-config`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn below_minimum(source: &str, secs: u64) -> ConfigRejection {
    ConfigRejection {
        source: source.to_string(),
        value: secs.to_string(),
        reason: format!("interval below {}s, using {}s", MIN_INTERVAL_SECS, MIN_INTERVAL_SECS),
    }
}
