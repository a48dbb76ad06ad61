//! REST client for the alerting backend.
//!
//! Every call runs through [`RequestClient::execute`], so retries and error classification are
//! the same for every endpoint.

use crate::{
    notification::{
        NewNotification, Notification, NotificationBackend, NotificationQuery, NotificationStats,
        Priority,
    },
    request::{ApiError, RequestClient},
    voice::SynthesisBackend,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use url::Url;

/// Per-attempt timeout; a slow attempt counts as a network failure and is retried
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a speech synthesis request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Synthesised audio, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SynthesisResponse {
    pub audio_base64: String,
    pub provider_used: String,
    /// Container format, e.g. `mp3`
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.to_lowercase().as_str(), "ok" | "healthy")
    }
}

#[derive(Debug, Serialize)]
struct MarkRead {
    read: bool,
}

#[derive(Debug, Serialize)]
struct RespondBody<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct BackendApi {
    http: reqwest::Client,
    base_url: Url,
    requests: RequestClient,
}

impl BackendApi {
    pub fn new(base_url: Url) -> Self {
        Self::with_request_client(base_url, RequestClient::default())
    }

    pub fn with_request_client(base_url: Url, requests: RequestClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            requests,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `base_url` with `segments` appended as path segments (each one percent-encoded)
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                let base_url = &self.base_url;
                ApiError::invalid_request(format!("Base URL cannot carry a path: {base_url}"))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn get_notification(&self, id: &str) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["api", "notifications", id])?;
        self.call_json(|http| http.get(url.clone())).await
    }

    pub async fn create_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["api", "notifications"])?;
        self.call_json(|http| http.post(url.clone()).json(notification))
            .await
    }

    pub async fn tts_providers(&self) -> Result<Vec<ProviderStatus>, ApiError> {
        let url = self.endpoint(&["api", "tts", "providers"])?;
        self.call_json(|http| http.get(url.clone())).await
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        let url = self.endpoint(&["health"])?;
        self.call_json(|http| http.get(url.clone())).await
    }

    /// Run one logical request, rebuilding it for every attempt, and decode a JSON body
    async fn call_json<T, B>(&self, build: B) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Send,
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.requests
            .execute(|| {
                let request = build(&self.http).timeout(REQUEST_TIMEOUT);
                async move {
                    let response = checked(request.send().await).await?;
                    response.json::<T>().await.map_err(|error| {
                        ApiError::invalid_response(format!("Invalid response body: {error}"))
                    })
                }
            })
            .await
    }

    /// As [`call_json`](Self::call_json) for endpoints whose body is ignored
    async fn call_empty<B>(&self, build: B) -> Result<(), ApiError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.requests
            .execute(|| {
                let request = build(&self.http).timeout(REQUEST_TIMEOUT);
                async move {
                    checked(request.send().await).await?;
                    Ok(())
                }
            })
            .await
    }
}

/// Reduce a send result to a successful response or a classified error
async fn checked(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, ApiError> {
    let response = result.map_err(ApiError::from_transport)?;
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_response(response).await)
    }
}

#[async_trait]
impl NotificationBackend for BackendApi {
    async fn list_notifications(
        &self,
        query: NotificationQuery,
    ) -> Result<Vec<Notification>, ApiError> {
        let url = self.endpoint(&["api", "notifications"])?;
        let pairs = query.to_pairs();
        self.call_json(|http| http.get(url.clone()).query(&pairs))
            .await
    }

    async fn mark_read(&self, id: &str) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["api", "notifications", id])?;
        self.call_json(|http| http.patch(url.clone()).json(&MarkRead { read: true }))
            .await
    }

    async fn respond(
        &self,
        id: &str,
        action: &str,
        note: Option<&str>,
    ) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["api", "notifications", id, "respond"])?;
        let body = RespondBody { action, note };
        self.call_json(|http| http.post(url.clone()).json(&body))
            .await
    }

    async fn delete_notification(&self, id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "notifications", id])?;
        self.call_empty(|http| http.delete(url.clone())).await
    }

    async fn stats(&self) -> Result<NotificationStats, ApiError> {
        let url = self.endpoint(&["api", "notifications", "stats"])?;
        self.call_json(|http| http.get(url.clone())).await
    }
}

#[async_trait]
impl SynthesisBackend for BackendApi {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse, ApiError> {
        let url = self.endpoint(&["api", "tts", "synthesize"])?;
        self.call_json(|http| http.post(url.clone()).json(request))
            .await
    }
}
