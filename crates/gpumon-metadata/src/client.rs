use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use gpumon_monitoring::{MonitoringError, MonitoringResult, TokenCache, TokenProvider};

use crate::error::{MetadataError, MetadataResult};
use crate::identity::{parse_zone_path, InstanceIdentity};

pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1/instance/";

/// Reads `computeMetadata/v1/instance/*` values.
#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> MetadataResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| MetadataError::Http {
                path: String::new(),
                source,
            })?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self { client, base_url })
    }

    /// Fetch one metadata value, without its trailing newline.
    pub async fn get(&self, path: &str) -> MetadataResult<String> {
        let http_err = |source| MetadataError::Http {
            path: path.to_string(),
            source,
        };

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(http_err)?;
        Ok(body.trim_end_matches(['\n', '\r']).to_string())
    }

    /// Resolve project, zone and instance id.
    pub async fn identity(&self) -> MetadataResult<InstanceIdentity> {
        let (project_id, zone) = parse_zone_path(&self.get("zone").await?)?;
        let instance_id = self.get("id").await?;
        Ok(InstanceIdentity {
            project_id,
            zone,
            instance_id,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Ambient credentials: access tokens of the instance's default service
/// account, cached until shortly before they expire. Concurrent callers
/// share one refresh.
pub struct MetadataTokenProvider {
    client: MetadataClient,
    cache: TokenCache,
}

impl MetadataTokenProvider {
    pub fn new(client: MetadataClient) -> Self {
        Self {
            client,
            cache: TokenCache::new(),
        }
    }

    async fn fetch(&self) -> MetadataResult<(String, DateTime<Utc>)> {
        tracing::debug!("Requesting access token from the metadata server");
        let body = self.client.get("service-accounts/default/token").await?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| MetadataError::MalformedToken(e.to_string()))?;
        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in);
        Ok((token.access_token, expires_at))
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn access_token(&self) -> MonitoringResult<String> {
        self.cache
            .get_or_refresh(|| async {
                self.fetch()
                    .await
                    .map_err(|e| MonitoringError::Auth(e.to_string()))
            })
            .await
    }
}
