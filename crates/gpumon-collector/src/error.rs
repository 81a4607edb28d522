use std::io;
use std::path::PathBuf;

use gpumon_metadata::MetadataError;
use gpumon_monitoring::MonitoringError;
use gpumon_smi::SmiError;
use thiserror::Error;

/// Errors building a [`CollectorConfig`](crate::config::CollectorConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of the collector daemon.
///
/// Only startup produces these, and each one stops the daemon. Failures
/// inside a tick stay [`SmiError`] or [`MonitoringError`] and are logged
/// where they happen.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `nvidia-smi --list-gpus` failed: the tool or the driver is missing.
    #[error("nvidia-smi is not usable: {0}")]
    ToolUnavailable(#[source] SmiError),

    #[error(transparent)]
    Smi(#[from] SmiError),

    #[error("failed to resolve instance identity: {0}")]
    Identity(#[from] MetadataError),

    #[error("failed to register metric descriptor {metric_type}: {source}")]
    Registration {
        metric_type: String,
        #[source]
        source: MonitoringError,
    },

    #[error(transparent)]
    Monitoring(#[from] MonitoringError),
}

pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_errors_keep_their_source() {
        let err = CollectorError::from(SmiError::NoUnits);
        assert!(matches!(err, CollectorError::Smi(SmiError::NoUnits)));

        let missing_tool = CollectorError::ToolUnavailable(SmiError::ToolInvocation {
            command: "nvidia-smi --list-gpus".into(),
            output: "No such file or directory (os error 2)".into(),
        });
        assert!(missing_tool.to_string().starts_with("nvidia-smi is not usable"));
        assert!(std::error::Error::source(&missing_tool).is_some());
    }

    #[test]
    fn test_registration_display() {
        let registration = CollectorError::Registration {
            metric_type: "custom.googleapis.com/gpu/memory_used".into(),
            source: MonitoringError::Api {
                status: 403,
                message: "Permission denied".into(),
            },
        };
        assert_eq!(
            registration.to_string(),
            "failed to register metric descriptor custom.googleapis.com/gpu/memory_used: api error (403): Permission denied"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Io {
            path: PathBuf::from("/etc/gpumon.toml"),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(
            err.to_string(),
            "cannot read config file /etc/gpumon.toml: not found"
        );
        assert!(matches!(CollectorError::from(err), CollectorError::Config(_)));
    }
}
