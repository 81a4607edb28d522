//! Cloud Monitoring v3 REST backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

use crate::auth::TokenProvider;
use crate::backend::MonitoringBackend;
use crate::error::{MonitoringError, MonitoringResult};
use crate::model::{project_name, CreateTimeSeriesRequest, MetricDescriptor, TimeSeries};

pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com";

/// Writes descriptors and points through the public REST API.
pub struct RestBackend {
    client: Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
}

impl RestBackend {
    pub fn new(
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> MonitoringResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gpumon/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, project_id: &str, collection: &str) -> String {
        format!("{}/v3/{}/{}", self.endpoint, project_name(project_id), collection)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> MonitoringResult<Response> {
        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        Ok(response)
    }
}

/// Turn a non-success response into an [`MonitoringError::Api`], preferring
/// the `error.message` field of the JSON error body.
async fn api_error(response: Response) -> MonitoringError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    MonitoringError::Api { status, message }
}

#[async_trait]
impl MonitoringBackend for RestBackend {
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptor,
    ) -> MonitoringResult<()> {
        let url = self.url(project_id, "metricDescriptors");
        let response = self.post(&url, descriptor).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                tracing::debug!(metric_type = %descriptor.metric_type, "Metric descriptor already exists");
                Ok(())
            }
            _ => Err(api_error(response).await),
        }
    }

    async fn create_time_series(
        &self,
        project_id: &str,
        series: &[TimeSeries],
    ) -> MonitoringResult<()> {
        let url = self.url(project_id, "timeSeries");
        let request = CreateTimeSeriesRequest {
            time_series: series,
        };
        let response = self.post(&url, &request).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(api_error(response).await)
        }
    }
}
