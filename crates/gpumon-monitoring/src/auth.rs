//! Access tokens for the monitoring API.
//!
//! The REST backend only needs a bearer token, so every credential source
//! is reduced to a [`TokenProvider`]. A credentials file is either a
//! service account key, exchanged for tokens through the OAuth2
//! JWT-bearer grant, or a JSON file carrying a ready `access_token`. The
//! metadata-server provider (ambient credentials of the instance's
//! service account) lives in `gpumon-metadata`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{MonitoringError, MonitoringResult};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const MONITORING_WRITE_SCOPE: &str = "https://www.googleapis.com/auth/monitoring.write";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh cached tokens this long before they expire.
const TOKEN_EXPIRY_SLACK_SECS: i64 = 60;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid OAuth2 access token.
    async fn access_token(&self) -> MonitoringResult<String>;
}

/// A fixed token, for tests and short-lived manual runs.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> MonitoringResult<String> {
        Ok(self.token.clone())
    }
}

/// A token shared by every publish task of a tick.
///
/// The lock is held across the refresh, so when the token expires one
/// caller fetches a new one and the others wait for it.
#[derive(Default)]
pub struct TokenCache {
    slot: tokio::sync::Mutex<Option<(String, DateTime<Utc>)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token, or the result of `refresh` if there is none or it
    /// expires within the next minute.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> MonitoringResult<String>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MonitoringResult<(String, DateTime<Utc>)>> + Send,
    {
        let mut slot = self.slot.lock().await;
        if let Some((token, expires_at)) = slot.as_ref() {
            if Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_SLACK_SECS) < *expires_at {
                return Ok(token.clone());
            }
        }

        let (token, expires_at) = refresh().await?;
        tracing::debug!(%expires_at, "Refreshed access token");
        *slot = Some((token.clone(), expires_at));
        Ok(token)
    }
}

fn credentials_error(path: &Path, reason: impl Into<String>) -> MonitoringError {
    MonitoringError::Credentials {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Reads a token from a JSON file with an `access_token` field.
///
/// The file is re-read on every request so an external refresher can
/// rotate it in place.
pub struct FileTokenProvider {
    path: PathBuf,
}

#[derive(Deserialize)]
struct TokenFile {
    access_token: Option<String>,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read and validate the file once. Used at startup so a bad path is
    /// fatal instead of failing every publish.
    pub async fn check(&self) -> MonitoringResult<()> {
        self.access_token().await.map(|_| ())
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn access_token(&self) -> MonitoringResult<String> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| credentials_error(&self.path, e.to_string()))?;
        let file: TokenFile = serde_json::from_str(&content)
            .map_err(|e| credentials_error(&self.path, format!("invalid JSON: {}", e)))?;

        match file.access_token {
            Some(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(credentials_error(&self.path, "missing access_token")),
        }
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Exchanges a signed assertion from a service account key for access
/// tokens, cached until shortly before they expire.
pub struct ServiceAccountTokenProvider {
    client: Client,
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
    token_uri: String,
    cache: TokenCache,
}

impl ServiceAccountTokenProvider {
    /// Parse a service account key file. An unusable private key is
    /// reported here rather than on the first request.
    pub fn from_json(path: &Path, json: &str, timeout: Duration) -> MonitoringResult<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| credentials_error(path, format!("invalid service account key: {}", e)))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| credentials_error(path, format!("invalid private_key: {}", e)))?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            client_email: key.client_email,
            key_id: key.private_key_id,
            signing_key,
            token_uri: key
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            cache: TokenCache::new(),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn assertion(&self, now: DateTime<Utc>) -> MonitoringResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: MONITORING_WRITE_SCOPE,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| MonitoringError::Auth(format!("cannot sign token request: {}", e)))
    }

    async fn exchange(&self) -> MonitoringResult<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let assertion = self.assertion(now)?;
        let auth_err = |e: reqwest::Error| MonitoringError::Auth(format!("token request failed: {}", e));

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(auth_err)?;
        let status = response.status();
        let body = response.text().await.map_err(auth_err)?;

        if !status.is_success() {
            return Err(MonitoringError::Auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| MonitoringError::Auth(format!("malformed token response: {}", e)))?;
        Ok((
            token.access_token,
            now + chrono::Duration::seconds(token.expires_in),
        ))
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self) -> MonitoringResult<String> {
        self.cache.get_or_refresh(|| self.exchange()).await
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: Option<String>,
    access_token: Option<String>,
}

/// Pick the provider for a credentials file: a service account key
/// (`"type": "service_account"`) or an `access_token` file.
pub async fn load_credentials_file(
    path: &Path,
    timeout: Duration,
) -> MonitoringResult<Arc<dyn TokenProvider>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| credentials_error(path, e.to_string()))?;
    let file: CredentialsFile = serde_json::from_str(&content)
        .map_err(|e| credentials_error(path, format!("invalid JSON: {}", e)))?;

    match (file.kind.as_deref(), file.access_token) {
        (Some("service_account"), _) => {
            let provider = ServiceAccountTokenProvider::from_json(path, &content, timeout)?;
            tracing::info!(path = %path.display(), account = %provider.client_email(), "Using service account key");
            Ok(Arc::new(provider))
        }
        (Some(kind), None) => Err(credentials_error(
            path,
            format!("unsupported credentials type {:?}", kind),
        )),
        _ => {
            let provider = FileTokenProvider::new(path);
            provider.check().await?;
            tracing::info!(path = %path.display(), "Using access token file");
            Ok(Arc::new(provider))
        }
    }
}
