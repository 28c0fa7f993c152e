//! Code-execution gateway. Generated matplotlib code is wrapped so the
//! figure comes back on stdout as base64 between markers, then run either in
//! a remote sandbox service or a local interpreter (see `micro`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{CoachError, Result};
use crate::sanitize::extract_marked_base64;
use crate::upstream::{endpoint, read_body, read_json};

const SERVICE: &str = "sandbox";
const STDERR_TAIL_CHARS: usize = 600;

const CHART_PROLOGUE: &str = "import matplotlib\nmatplotlib.use('Agg')\n";

const CHART_EPILOGUE: &str = r#"
import io as _viz_io
import base64 as _viz_b64
import matplotlib.pyplot as _viz_plt
_viz_fig = _viz_plt.gcf()
if _viz_fig.get_axes():
    _viz_buf = _viz_io.BytesIO()
    _viz_fig.savefig(_viz_buf, format='png', dpi=100, bbox_inches='tight', facecolor='white')
    print('BASE64_START' + _viz_b64.b64encode(_viz_buf.getvalue()).decode('ascii') + 'BASE64_END')
    _viz_plt.close('all')
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Base64 PNG recovered from the stdout markers.
    pub png: Option<String>,
}

impl ExecutionOutput {
    pub(crate) fn from_streams(exit_code: i32, stdout: String, stderr: String) -> Result<Self> {
        if exit_code != 0 {
            return Err(CoachError::Execution(format!(
                "python exited with code {exit_code}: {}",
                tail(&stderr, STDERR_TAIL_CHARS)
            )));
        }
        let png = extract_marked_base64(&stdout);
        Ok(Self {
            exit_code,
            stdout,
            stderr,
            png,
        })
    }

    pub fn png_data_url(&self) -> Option<String> {
        self.png
            .as_ref()
            .map(|data| format!("data:image/png;base64,{data}"))
    }
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run_python(&self, code: &str) -> Result<ExecutionOutput>;
}

/// Forces a headless backend and appends the figure export epilogue.
pub fn wrap_chart_script(code: &str) -> String {
    let mut script = String::with_capacity(CHART_PROLOGUE.len() + code.len() + CHART_EPILOGUE.len());
    script.push_str(CHART_PROLOGUE);
    script.push_str(code.trim_end());
    script.push('\n');
    script.push_str(CHART_EPILOGUE);
    script
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSandboxConfig {
    pub base_url: String,
    pub api_key: String,
    pub template: String,
    pub request_timeout: Duration,
}

impl RemoteSandboxConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            template: "base".to_string(),
            request_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxCreated {
    sandbox_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    error: Option<Value>,
}

/// Hosted sandbox reached over REST: create, run one command, delete.
#[derive(Clone)]
pub struct RemoteSandbox {
    http: reqwest::Client,
    config: RemoteSandboxConfig,
}

impl RemoteSandbox {
    pub fn new(http: reqwest::Client, config: RemoteSandboxConfig) -> Self {
        Self { http, config }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, endpoint(&self.config.base_url, path))
            .header("X-API-Key", &self.config.api_key)
            .timeout(self.config.request_timeout)
    }

    async fn create(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&json!({ "template": self.config.template }))
            .send()
            .await
            .map_err(CoachError::network)?;
        let created: SandboxCreated = read_json(SERVICE, response).await?;
        Ok(created.sandbox_id)
    }

    async fn run(&self, sandbox_id: &str, code: &str) -> Result<ExecutionOutput> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{sandbox_id}/commands"),
            )
            .json(&json!({ "command": "python3", "args": ["-c", code] }))
            .send()
            .await
            .map_err(CoachError::network)?;
        let result: CommandResult = read_json(SERVICE, response).await?;
        if let Some(error) = result.error.filter(|error| !error.is_null()) {
            let message = error
                .get("value")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(CoachError::Execution(message));
        }
        ExecutionOutput::from_streams(result.exit_code.unwrap_or(0), result.stdout, result.stderr)
    }

    async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await
            .map_err(CoachError::network)?;
        read_body(SERVICE, response).await.map(|_| ())
    }
}

#[async_trait]
impl CodeRunner for RemoteSandbox {
    async fn run_python(&self, code: &str) -> Result<ExecutionOutput> {
        let sandbox_id = self.create().await?;
        debug!(%sandbox_id, "remote sandbox created");
        let outcome = self.run(&sandbox_id, code).await;
        if let Err(err) = self.delete(&sandbox_id).await {
            warn!(%sandbox_id, error = %err, "failed to delete remote sandbox");
        }
        outcome
    }
}
