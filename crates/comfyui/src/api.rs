//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Only workflow submission is used. The submission response tells us
//! the job was queued; results arrive exclusively as WebSocket events.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use snapbooth_core::builder::SubmittedJob;

/// Upper bound on a single submission, connect through response.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a `POST /prompt` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    /// Session id of the WebSocket that should receive the events.
    pub client_id: String,
    /// The resolved workflow graph.
    pub prompt: serde_json::Value,
    /// `[node id, output slot]` pairs to execute to.
    pub outputs: Vec<(String, u32)>,
    /// Re-run even if ComfyUI has the outputs cached.
    pub force: bool,
}

impl SubmitRequest {
    pub fn for_job(session_id: &str, job: &SubmittedJob) -> Self {
        Self {
            client_id: session_id.to_string(),
            prompt: job.to_prompt_json(),
            outputs: job.desired_outputs().to_vec(),
            force: true,
        }
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Sends a job to the remote service, out of band from the event stream.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<(), ComfyUIApiError>;
}

/// HTTP client for a single ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    timeout: Duration,
}

impl ComfyUIApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }

    /// Bound each request by `timeout` instead of [`DEFAULT_SUBMIT_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue a workflow with `POST /prompt`. Only the status is checked.
    pub async fn submit_workflow(&self, request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        tracing::info!(client_id = %request.client_id, "Workflow submitted to ComfyUI");
        Ok(())
    }

    /// Ensure the response has a success status code, or return a
    /// [`ComfyUIApiError::ApiError`] with the status and body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl JobSubmitter for ComfyUIApi {
    async fn submit(&self, request: &SubmitRequest) -> Result<(), ComfyUIApiError> {
        self.submit_workflow(request).await
    }
}
