use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{CoachError, Result};
use crate::exec::{CodeRunner, ExecutionOutput};

#[derive(Clone, Debug)]
pub struct LocalSandboxConfig {
    root: PathBuf,
    python: String,
    timeout: Duration,
    max_output_bytes: usize,
    base_env: HashMap<String, String>,
}

impl LocalSandboxConfig {
    pub fn new(root: impl AsRef<Path>, python: impl Into<String>) -> Result<Self> {
        let root = root.as_ref();
        if root.is_relative() {
            return Err(CoachError::InvalidOperation(
                "local sandbox root must be absolute".to_string(),
            ));
        }
        let python = python.into().trim().to_string();
        if python.is_empty() {
            return Err(CoachError::InvalidOperation(
                "python command must not be empty".to_string(),
            ));
        }
        std::fs::create_dir_all(root)?;

        let mut base_env = HashMap::new();
        base_env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
        );
        base_env.insert("LANG".to_string(), "C.UTF-8".to_string());
        base_env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        base_env.insert("MPLBACKEND".to_string(), "Agg".to_string());

        Ok(Self {
            root: root.to_path_buf(),
            python,
            timeout: Duration::from_secs(20),
            max_output_bytes: 8 * 1024 * 1024,
            base_env,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(CoachError::InvalidOperation(
                "local sandbox timeout must be greater than zero".to_string(),
            ));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(CoachError::InvalidOperation(
                "local sandbox max_output_bytes must be greater than zero".to_string(),
            ));
        }
        self.max_output_bytes = limit;
        Ok(self)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into().trim().to_string();
        if !key.is_empty() {
            self.base_env.insert(key, value.into());
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

/// Runs scripts with a local interpreter, one scratch directory per run.
#[derive(Clone, Debug)]
pub struct LocalSandbox {
    config: LocalSandboxConfig,
}

impl LocalSandbox {
    pub fn new(config: LocalSandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalSandboxConfig {
        &self.config
    }
}

#[async_trait]
impl CodeRunner for LocalSandbox {
    async fn run_python(&self, code: &str) -> Result<ExecutionOutput> {
        let workdir = self.config.root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&workdir).await?;
        let outcome = run_script(&self.config, &workdir, code).await;
        if let Err(err) = fs::remove_dir_all(&workdir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(workdir = %workdir.display(), error = %err, "failed to remove sandbox workdir");
            }
        }
        outcome
    }
}

async fn run_script(
    config: &LocalSandboxConfig,
    workdir: &Path,
    source: &str,
) -> Result<ExecutionOutput> {
    let mut contents = source.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    let script_path = workdir.join("chart.py");
    {
        let mut file = fs::File::create(&script_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
    }

    let mut command = Command::new(&config.python);
    command.kill_on_drop(true);
    command.current_dir(workdir);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.env_clear();
    for (key, value) in &config.base_env {
        command.env(key, value);
    }
    command.env("HOME", workdir);
    command.env("MPLCONFIGDIR", workdir);
    command.arg("-u").arg(&script_path);

    let start = Instant::now();
    let output = match timeout(config.timeout, command.spawn()?.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(CoachError::Timeout(config.timeout)),
    };
    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "local python run finished");

    if output.stdout.len() > config.max_output_bytes {
        return Err(CoachError::OutputTooLarge {
            stream: "stdout",
            limit: config.max_output_bytes,
        });
    }
    if output.stderr.len() > config.max_output_bytes {
        return Err(CoachError::OutputTooLarge {
            stream: "stderr",
            limit: config.max_output_bytes,
        });
    }

    let exit_code = output.status.code().ok_or(CoachError::TerminatedBySignal)?;
    ExecutionOutput::from_streams(
        exit_code,
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}
