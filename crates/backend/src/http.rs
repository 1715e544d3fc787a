//! REST client for the compute backend.
//!
//! | Operation | Request                        | Success body                        |
//! |-----------|--------------------------------|-------------------------------------|
//! | submit    | `POST {base}/tasks` (raw body) | `{"task_id": "..."}`                |
//! | poll      | `GET {base}/tasks/{id}`        | [`TaskStatusResponse`]              |
//! | cancel    | `POST {base}/tasks/{id}/cancel`| any                                 |
//!
//! Network errors, 429 and 5xx map to [`BackendError::Transient`], other
//! 4xx to [`BackendError::Permanent`], and client-side timeouts to
//! [`BackendError::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::client::{BackendClient, BackendError, BackendOutput, BackendPoll, BackendTaskId};

/// Response of `POST /tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub task_id: String,
}

/// Response of `GET /tasks/{id}`.
#[derive(Debug, Deserialize)]
pub struct TaskStatusResponse {
    /// `queued`, `running`, `succeeded` or `failed`.
    pub status: String,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    pub error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
pub struct TaskOutput {
    pub content_type: String,
    /// Standard base64.
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskError {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// HTTP client for a single backend deployment.
pub struct HttpBackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackendClient {
    /// Build a client whose every request is bounded by `call_timeout`.
    pub fn new(base_url: impl Into<String>, call_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| BackendError::Permanent(format!("invalid HTTP client config: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    // ---- private helpers ----

    /// Map a non-2xx response to a classified error.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(classify_status(status, body))
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        response.json::<T>().await.map_err(|e| {
            BackendError::Permanent(format!("unexpected backend response: {e}"))
        })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn submit(&self, payload: &[u8]) -> Result<BackendTaskId, BackendError> {
        let response = self
            .client
            .post(format!("{}/tasks", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(classify_transport)?;

        let body: SubmitResponse = Self::parse_response(response).await?;
        Ok(body.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<BackendPoll, BackendError> {
        let response = self
            .client
            .get(format!("{}/tasks/{}", self.base_url, task_id))
            .send()
            .await
            .map_err(classify_transport)?;

        let body: TaskStatusResponse = Self::parse_response(response).await?;
        task_status_to_poll(body)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/tasks/{}/cancel", self.base_url, task_id))
            .send()
            .await
            .map_err(classify_transport)?;

        Self::ensure_success(response).await?;
        Ok(())
    }
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    let message = format!("backend returned {}: {body}", status.as_u16());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Transient(error.to_string())
    }
}

fn task_status_to_poll(body: TaskStatusResponse) -> Result<BackendPoll, BackendError> {
    match body.status.as_str() {
        "queued" | "running" => Ok(BackendPoll::running(body.progress.clamp(0.0, 1.0))),
        "succeeded" => {
            let outputs = body
                .outputs
                .into_iter()
                .map(|out| {
                    STANDARD
                        .decode(out.data.as_bytes())
                        .map(|bytes| BackendOutput::new(bytes, out.content_type))
                        .map_err(|e| BackendError::Permanent(format!("undecodable output: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BackendPoll::succeeded(outputs))
        }
        "failed" => {
            let error = match body.error {
                Some(TaskError { message, retryable: true }) => BackendError::Transient(message),
                Some(TaskError { message, .. }) => BackendError::Permanent(message),
                None => BackendError::Permanent("task failed without an error message".into()),
            };
            Ok(BackendPoll::failed(error))
        }
        other => Err(BackendError::Permanent(format!("unknown task status \"{other}\""))),
    }
}
