//! Asynchronous job submit/poll on top of a key-value store.
//!
//! A submit writes a `pending` record and hands the long-running work to the
//! tokio runtime; polls read the record back. The worker is the only writer
//! of a given job id, and every write refreshes the record's time-to-live.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hex::encode as hex_encode;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{error, info, warn};

use crate::errors::{CoachError, Result};
use crate::store::KeyValueStore;
use crate::task::TaskType;

const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);
const KEY_PREFIX: &str = "job:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Diagram,
    Ascii,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Diagram => "diagram",
            JobKind::Ascii => "ascii",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

/// Result payload, tagged by the kind of job that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResult {
    Diagram {
        #[serde(rename = "generatedSvg")]
        generated_svg: Option<String>,
        #[serde(rename = "generatedImageBase64")]
        generated_image_base64: Option<String>,
    },
    Ascii {
        #[serde(rename = "asciiDiagram")]
        ascii_diagram: String,
    },
}

impl JobResult {
    pub fn kind(&self) -> JobKind {
        match self {
            JobResult::Diagram { .. } => JobKind::Diagram,
            JobResult::Ascii { .. } => JobKind::Ascii,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content: String,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    pub feedback: Option<String>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: &JobRequest) -> Self {
        let now = Utc::now();
        Self {
            id: generate_job_id(),
            kind: request.kind,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            content: request.content.clone(),
            task_type: request.task_type,
            image_url: request.image_url.clone(),
            image_name: request.image_name.clone(),
            feedback: None,
            result: None,
            error: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if next.rank() <= self.status.rank() {
            return Err(CoachError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(JobStatus::Processing)
    }

    pub fn complete(&mut self, result: JobResult) -> Result<()> {
        if result.kind() != self.kind {
            return Err(CoachError::InvalidOperation(format!(
                "{} job cannot hold a {} result",
                self.kind,
                result.kind()
            )));
        }
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }
}

/// `job_<unix millis>_<12 hex chars>`.
pub fn generate_job_id() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    format!("job_{}_{}", Utc::now().timestamp_millis(), hex_encode(bytes))
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub content: String,
    pub task_type: TaskType,
    pub image_url: Option<String>,
    pub image_name: Option<String>,
    /// Earlier job whose feedback should be reused instead of regenerated.
    pub seed_from: Option<String>,
}

impl JobRequest {
    pub fn new(kind: JobKind, task_type: TaskType, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            task_type,
            image_url: None,
            image_name: None,
            seed_from: None,
        }
    }

    pub fn with_image(mut self, url: Option<String>, name: Option<String>) -> Self {
        self.image_url = url;
        self.image_name = name;
        self
    }

    pub fn with_seed(mut self, job_id: Option<String>) -> Self {
        self.seed_from = job_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSubmission {
    pub job_id: String,
    pub status: String,
}

#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl JobStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            ttl: DEFAULT_JOB_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.max(Duration::from_secs(1));
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    pub async fn create(&self, job: &Job) -> Result<()> {
        self.save(job).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<Job>> {
        let Some(raw) = self.backend.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| CoachError::Store(format!("corrupt job record '{id}': {err}")))
    }

    /// Whole-record overwrite; refreshes the time-to-live.
    pub async fn save(&self, job: &Job) -> Result<()> {
        let serialized = serde_json::to_string(job)
            .map_err(|err| CoachError::Store(format!("failed to serialize job: {err}")))?;
        self.backend
            .set_ex(&Self::key(&job.id), &serialized, self.ttl)
            .await
    }
}

/// The long-running work behind a job, split so feedback survives a failed
/// render stage.
#[async_trait]
pub trait JobWorker: Send + Sync {
    async fn feedback(&self, job: &Job) -> Result<String>;
    async fn render(&self, job: &Job) -> Result<JobResult>;
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: JobStore,
    worker: Arc<dyn JobWorker>,
}

impl JobOrchestrator {
    pub fn new(store: JobStore, worker: Arc<dyn JobWorker>) -> Self {
        Self { store, worker }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn submit(&self, request: JobRequest) -> Result<JobSubmission> {
        if request.content.trim().is_empty() {
            return Err(CoachError::InvalidInput(
                "content must not be empty".to_string(),
            ));
        }

        let mut job = Job::new(&request);
        if let Some(seed_id) = request.seed_from.as_deref() {
            match self.store.load(seed_id).await {
                Ok(Some(seed)) if seed.feedback.is_some() => {
                    info!(job_id = %job.id, seed_id, "reusing feedback from earlier job");
                    job.feedback = seed.feedback;
                }
                Ok(_) => {}
                Err(err) => warn!(seed_id, error = %err, "failed to load seed job"),
            }
        }
        self.store.create(&job).await?;
        info!(job_id = %job.id, kind = %job.kind, task = %job.task_type, "job submitted");

        let store = self.store.clone();
        let worker = self.worker.clone();
        let job_id = job.id.clone();
        task::spawn(async move {
            let inner = task::spawn(run_job(store.clone(), worker, job_id.clone()));
            if let Err(join_err) = inner.await {
                error!(job_id = %job_id, error = %join_err, "job worker aborted");
                record_failure(&store, &job_id, format!("worker aborted: {join_err}")).await;
            }
        });

        Ok(JobSubmission {
            job_id: job.id,
            status: "submitted".to_string(),
        })
    }

    pub async fn poll(&self, id: &str) -> Result<Job> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| CoachError::JobNotFound(id.to_string()))
    }
}

async fn run_job(store: JobStore, worker: Arc<dyn JobWorker>, job_id: String) {
    let mut job = match store.load(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id = %job_id, "job expired before processing started");
            return;
        }
        Err(err) => {
            error!(job_id = %job_id, error = %err, "failed to load job");
            return;
        }
    };

    if let Err(err) = process(&store, worker.as_ref(), &mut job).await {
        error!(job_id = %job_id, error = %err, "job failed");
        if job.status.is_terminal() {
            return;
        }
        if let Err(fail_err) = job.fail(err.to_string()) {
            error!(job_id = %job_id, error = %fail_err, "cannot mark job failed");
            return;
        }
        if let Err(save_err) = store.save(&job).await {
            error!(job_id = %job_id, error = %save_err, "failed to persist job failure");
        }
    }
}

async fn process(store: &JobStore, worker: &dyn JobWorker, job: &mut Job) -> Result<()> {
    job.start()?;
    store.save(job).await?;

    if job.feedback.is_none() {
        let feedback = worker.feedback(job).await?;
        job.feedback = Some(feedback);
        job.updated_at = Utc::now();
        store.save(job).await?;
    }

    let result = worker.render(job).await?;
    job.complete(result)?;
    store.save(job).await?;
    info!(job_id = %job.id, "job completed");
    Ok(())
}

async fn record_failure(store: &JobStore, job_id: &str, message: String) {
    match store.load(job_id).await {
        Ok(Some(mut job)) if !job.status.is_terminal() => {
            if job.fail(message).is_ok() {
                if let Err(err) = store.save(&job).await {
                    error!(job_id, error = %err, "failed to persist job failure");
                }
            }
        }
        Ok(_) => {}
        Err(err) => error!(job_id, error = %err, "failed to load aborted job"),
    }
}
