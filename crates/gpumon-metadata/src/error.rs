use thiserror::Error;

/// Errors resolving data from the metadata server.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request for {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("metadata server returned {status} for {path}")]
    Status { path: String, status: u16 },

    /// The `zone` value is not of the form `projects/<project>/zones/<zone>`.
    #[error("malformed zone metadata: {0:?}")]
    MalformedZone(String),

    #[error("malformed token response: {0}")]
    MalformedToken(String),
}

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
