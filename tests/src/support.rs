use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use coach::exec::CodeRunner;
use coach::jobs::{Job, JobOrchestrator, JobStore, JobWorker};
use coach::{
    ContentClient, ContentConfig, MemoryStore, OpenAiClient, OpenAiConfig, RemoteSandbox,
    RemoteSandboxConfig, ReviewConfig, ReviewService,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SANDBOX_ID: &str = "sbx-e2e";

pub fn temp_workspace() -> Result<TempDir> {
    Ok(tempdir()?)
}

/// Review service whose chat, image and sandbox gateways all point at `server`.
pub fn review_service(server: &MockServer) -> ReviewService {
    let http = reqwest::Client::new();
    let chat = OpenAiClient::new(
        http.clone(),
        OpenAiConfig::new(server.uri())
            .with_api_key(Some("sk-test".to_string()))
            .with_timeout(Duration::from_secs(5)),
    );
    let runner: Arc<dyn CodeRunner> = Arc::new(RemoteSandbox::new(
        http,
        RemoteSandboxConfig::new(server.uri(), "e2b-test").with_timeout(Duration::from_secs(5)),
    ));
    ReviewService::new(chat, runner, ReviewConfig::default())
}

pub fn content_client(server: &MockServer) -> ContentClient {
    ContentClient::new(
        reqwest::Client::new(),
        ContentConfig::new("coach", "visuals").with_base_url(server.uri()),
    )
}

pub fn orchestrator(review: Arc<ReviewService>) -> JobOrchestrator {
    let worker: Arc<dyn JobWorker> = review;
    JobOrchestrator::new(JobStore::new(Arc::new(MemoryStore::new())), worker)
}

pub fn chat_reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "role": "assistant", "content": text } }]
    }))
}

/// Chat completion answered with `text` whenever the request body contains `marker`.
pub fn chat_mock(marker: &str, text: &str) -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains(marker))
        .respond_with(chat_reply(text))
}

pub async fn mount_sandbox(server: &MockServer, stdout: &str) {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sandboxId": SANDBOX_ID })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/sandboxes/{SANDBOX_ID}/commands")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "stdout": stdout, "exitCode": 0 })),
        )
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/sandboxes/{SANDBOX_ID}")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1..)
        .mount(server)
        .await;
}

pub async fn wait_for_terminal(jobs: &JobOrchestrator, id: &str) -> Result<Job> {
    for _ in 0..400 {
        let job = jobs.poll(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("job {id} did not finish")
}
