//! Read-only access to a content-hosting repository (GitHub contents API),
//! used as a cache of precomputed vision analyses.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::errors::{CoachError, Result};
use crate::task::TaskType;
use crate::upstream::{endpoint, read_json};

const SERVICE: &str = "content";
const USER_AGENT: &str = "task1-coach";

#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub base_url: String,
    pub owner: String,
    pub repo: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl ContentConfig {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ContentFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Clone)]
pub struct ContentClient {
    http: reqwest::Client,
    config: ContentConfig,
}

impl ContentClient {
    pub fn new(http: reqwest::Client, config: ContentConfig) -> Self {
        Self { http, config }
    }

    /// Decoded text of the file at `path`, or `None` when it does not exist.
    pub async fn fetch_text(&self, path: &str) -> Result<Option<String>> {
        let url = endpoint(
            &self.config.base_url,
            &format!(
                "/repos/{}/{}/contents/{}",
                self.config.owner,
                self.config.repo,
                path.trim_start_matches('/')
            ),
        );
        let mut request = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .timeout(self.config.request_timeout);
        if let Some(token) = &self.config.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }
        let response = request.send().await.map_err(CoachError::network)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "content not found");
            return Ok(None);
        }
        let file: ContentFile = read_json(SERVICE, response).await?;
        decode_content(file).map(Some)
    }
}

fn decode_content(file: ContentFile) -> Result<String> {
    let raw = file.content.unwrap_or_default();
    if file.encoding.as_deref().is_some_and(|encoding| encoding != "base64") {
        return Ok(raw);
    }
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| CoachError::MalformedResponse {
            service: SERVICE,
            detail: format!("invalid base64 content: {err}"),
        })?;
    String::from_utf8(bytes).map_err(|err| CoachError::MalformedResponse {
        service: SERVICE,
        detail: err.to_string(),
    })
}

/// `visuals/<task>/<image stem>.txt`, the cache location of an analysis.
pub fn analysis_path(task_type: TaskType, image_name: &str) -> String {
    let file = image_name.rsplit('/').next().unwrap_or(image_name);
    let stem = match file.rfind('.') {
        Some(index) if index > 0 => &file[..index],
        _ => file,
    };
    format!("visuals/{}/{stem}.txt", task_type.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: Option<&str>) -> ContentClient {
        ContentClient::new(
            reqwest::Client::new(),
            ContentConfig::new("owner", "visuals-repo")
                .with_base_url(server.uri())
                .with_token(token.map(str::to_string)),
        )
    }

    #[test]
    fn builds_analysis_paths() {
        assert_eq!(
            analysis_path(TaskType::Maps, "island-1.png"),
            "visuals/maps/island-1.txt"
        );
        assert_eq!(
            analysis_path(TaskType::Flowchart, "/flowchart/cement.v2.jpeg"),
            "visuals/flowchart/cement.v2.txt"
        );
        assert_eq!(analysis_path(TaskType::Maps, "noext"), "visuals/maps/noext.txt");
    }

    #[tokio::test]
    async fn decodes_wrapped_base64() {
        let server = MockServer::start().await;
        let encoded = STANDARD.encode("Two maps of a village.\nA road was added.");
        let wrapped = format!("{}\n{}", &encoded[..20], &encoded[20..]);
        Mock::given(method("GET"))
            .and(path("/repos/owner/visuals-repo/contents/visuals/maps/village.txt"))
            .and(header("authorization", "token ghp_test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "content": wrapped, "encoding": "base64" })),
            )
            .mount(&server)
            .await;

        let text = client(&server, Some("ghp_test"))
            .fetch_text("visuals/maps/village.txt")
            .await
            .unwrap();
        assert_eq!(
            text.as_deref(),
            Some("Two maps of a village.\nA road was added.")
        );
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })))
            .mount(&server)
            .await;
        let text = client(&server, None).fetch_text("visuals/maps/x.txt").await.unwrap();
        assert!(text.is_none());
    }

    #[tokio::test]
    async fn server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "message": "rate limited" })))
            .mount(&server)
            .await;
        let err = client(&server, None)
            .fetch_text("visuals/maps/x.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::Upstream { status: 403, .. }));
    }
}
