//! Batch API gateway: a chat request is uploaded as a one-line JSONL file,
//! run as a batch, polled until it settles, and its output downloaded.

use std::time::{Duration, Instant};

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::chat::{ChatCompletionResponse, ChatRequest, OpenAiClient};
use crate::errors::{CoachError, Result};
use crate::upstream::{read_body, read_json};

const SERVICE: &str = "batch";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Expired
                | BatchStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Serialize)]
struct BatchLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: &'a ChatRequest,
}

#[derive(Debug, Deserialize)]
struct BatchOutputLine {
    #[serde(default)]
    response: Option<BatchOutputResponse>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BatchOutputResponse {
    status_code: u16,
    body: Value,
}

#[derive(Clone)]
pub struct BatchClient {
    client: OpenAiClient,
    poll_interval: Duration,
    deadline: Duration,
}

impl BatchClient {
    pub fn new(client: OpenAiClient) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(600),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn upload_input(&self, custom_id: &str, request: &ChatRequest) -> Result<String> {
        let line = serde_json::to_string(&BatchLine {
            custom_id,
            method: "POST",
            url: "/v1/chat/completions",
            body: request,
        })
        .map_err(|err| CoachError::InvalidOperation(format!("unserializable batch line: {err}")))?;
        let part = Part::bytes(format!("{line}\n").into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(CoachError::network)?;
        let form = Form::new().text("purpose", "batch").part("file", part);
        let response = self
            .client
            .post("/v1/files")
            .multipart(form)
            .send()
            .await
            .map_err(CoachError::network)?;
        let file: FileObject = read_json(SERVICE, response).await?;
        Ok(file.id)
    }

    pub async fn create(&self, input_file_id: &str) -> Result<BatchJob> {
        let response = self
            .client
            .post("/v1/batches")
            .json(&serde_json::json!({
                "input_file_id": input_file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }))
            .send()
            .await
            .map_err(CoachError::network)?;
        read_json(SERVICE, response).await
    }

    pub async fn get(&self, batch_id: &str) -> Result<BatchJob> {
        let response = self
            .client
            .get(&format!("/v1/batches/{batch_id}"))
            .send()
            .await
            .map_err(CoachError::network)?;
        read_json(SERVICE, response).await
    }

    pub async fn download(&self, file_id: &str) -> Result<String> {
        let response = self
            .client
            .get(&format!("/v1/files/{file_id}/content"))
            .send()
            .await
            .map_err(CoachError::network)?;
        let bytes = read_body(SERVICE, response).await?;
        String::from_utf8(bytes).map_err(|err| CoachError::MalformedResponse {
            service: SERVICE,
            detail: err.to_string(),
        })
    }

    /// Runs a single chat request through the batch endpoint and returns the
    /// completion text.
    pub async fn run_chat(&self, custom_id: &str, request: &ChatRequest) -> Result<String> {
        let file_id = self.upload_input(custom_id, request).await?;
        let mut batch = self.create(&file_id).await?;
        info!(batch_id = %batch.id, custom_id, "batch submitted");

        let started = Instant::now();
        while !batch.status.is_terminal() {
            if started.elapsed() >= self.deadline {
                return Err(CoachError::Timeout(self.deadline));
            }
            sleep(self.poll_interval).await;
            batch = self.get(&batch.id).await?;
            debug!(batch_id = %batch.id, status = ?batch.status, "batch polled");
        }

        if batch.status != BatchStatus::Completed {
            return Err(CoachError::Upstream {
                service: SERVICE,
                status: 200,
                message: format!(
                    "batch {} ended as {:?}{}",
                    batch.id,
                    batch.status,
                    batch
                        .errors
                        .as_ref()
                        .map(|errors| format!(": {errors}"))
                        .unwrap_or_default()
                ),
            });
        }

        let output_id = batch
            .output_file_id
            .as_deref()
            .ok_or_else(|| CoachError::MalformedResponse {
                service: SERVICE,
                detail: "completed batch has no output file".to_string(),
            })?;
        let output = self.download(output_id).await?;
        parse_output(&output)
    }
}

fn parse_output(output: &str) -> Result<String> {
    let line = output
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| CoachError::MalformedResponse {
            service: SERVICE,
            detail: "batch output is empty".to_string(),
        })?;
    let parsed: BatchOutputLine =
        serde_json::from_str(line).map_err(|err| CoachError::MalformedResponse {
            service: SERVICE,
            detail: err.to_string(),
        })?;
    if let Some(error) = parsed.error.filter(|error| !error.is_null()) {
        return Err(CoachError::Upstream {
            service: SERVICE,
            status: 200,
            message: error.to_string(),
        });
    }
    let response = parsed.response.ok_or_else(|| CoachError::MalformedResponse {
        service: SERVICE,
        detail: "batch line has no response".to_string(),
    })?;
    if !(200..300).contains(&response.status_code) {
        return Err(CoachError::Upstream {
            service: SERVICE,
            status: response.status_code,
            message: response.body.to_string(),
        });
    }
    let completion: ChatCompletionResponse =
        serde_json::from_value(response.body).map_err(|err| CoachError::MalformedResponse {
            service: SERVICE,
            detail: err.to_string(),
        })?;
    completion.into_text(SERVICE)
}
