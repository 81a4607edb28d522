use std::path::PathBuf;

use thiserror::Error;

/// Errors talking to the monitoring backend.
#[derive(Debug, Error)]
pub enum MonitoringError {
    /// Transport-level failure (DNS, connect, TLS, timeout).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// No access token could be obtained.
    #[error("auth error: {0}")]
    Auth(String),

    /// The credentials file could not be read or parsed.
    #[error("credentials file {path:?}: {reason}")]
    Credentials { path: PathBuf, reason: String },

    /// Injected failure from a test backend.
    #[error("rejected by backend: {0}")]
    Rejected(String),
}

pub type MonitoringResult<T> = std::result::Result<T, MonitoringError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_api_error() {
        let err = MonitoringError::Api {
            status: 403,
            message: "Permission monitoring.timeSeries.create denied".into(),
        };
        let s = err.to_string();
        assert!(s.contains("403"));
        assert!(s.contains("timeSeries.create"));
    }

    #[test]
    fn test_display_credentials_error() {
        let err = MonitoringError::Credentials {
            path: PathBuf::from("/etc/gpumon/token.json"),
            reason: "missing access_token".into(),
        };
        assert!(err.to_string().contains("/etc/gpumon/token.json"));
    }
}
