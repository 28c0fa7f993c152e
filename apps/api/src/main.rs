use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use coach::batch::BatchClient;
use coach::chat::{OpenAiClient, OpenAiConfig};
use coach::content::{ContentClient, ContentConfig};
use coach::exec::{CodeRunner, RemoteSandbox, RemoteSandboxConfig};
use coach::gallery::{GalleryClient, GalleryConfig};
use coach::jobs::{Job, JobKind, JobOrchestrator, JobRequest, JobResult, JobStatus, JobStore, JobWorker};
use coach::micro::{LocalSandbox, LocalSandboxConfig};
use coach::review::{ReviewConfig, ReviewService};
use coach::store::{KeyValueStore, MemoryStore, RedisStore};
use coach::task::{Phase, RequestType, TaskRequest};
use coach::CoachError;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace, Resource};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{dispatcher, error, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;

const MISSING_DATA: &str = "Missing required data.";
const RETRY_FEEDBACK: &str = "An error occurred. Please try again.";

struct AppMetrics {
    registry: Registry,
    request_counter: IntCounterVec,
    request_duration: HistogramVec,
    job_counter: IntCounterVec,
}

impl AppMetrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let request_counter = IntCounterVec::new(
            Opts::new("coach_requests_total", "Requests handled by route and outcome"),
            &["route", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "coach_request_duration_seconds",
                "Latency of request handling in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["route"],
        )?;
        let job_counter = IntCounterVec::new(
            Opts::new("coach_jobs_submitted_total", "Background jobs submitted by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(request_counter.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(job_counter.clone()))?;
        Ok(Self {
            registry,
            request_counter,
            request_duration,
            job_counter,
        })
    }

    fn record_request(&self, route: &str, outcome: &str, duration: Duration) {
        self.request_counter
            .with_label_values(&[route, outcome])
            .inc();
        self.request_duration
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    fn record_job(&self, kind: JobKind) {
        self.job_counter.with_label_values(&[kind.as_str()]).inc();
    }

    fn render(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct AppState {
    review: Arc<ReviewService>,
    jobs: Arc<JobOrchestrator>,
    gallery: Option<Arc<GalleryClient>>,
    metrics: Arc<AppMetrics>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let metrics = Arc::new(AppMetrics::new()?);
    let bind_addr = resolve_bind_address()?;
    let http = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let review = Arc::new(initialize_review(&http)?);
    let store = initialize_store().await?;
    let worker: Arc<dyn JobWorker> = review.clone();
    let jobs = Arc::new(JobOrchestrator::new(store, worker));
    let gallery = initialize_gallery(&http).map(Arc::new);

    let state = AppState {
        review,
        jobs,
        gallery,
        metrics,
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "server starting");
    axum::serve(listener, app).await?;
    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(handle_feedback).options(preflight))
        .route("/feedback", post(handle_feedback).options(preflight))
        .route("/images", get(list_images).options(preflight))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().json();
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Some(endpoint) = otlp_endpoint() {
        let resource = Resource::new(vec![
            KeyValue::new("service.name", "coach-api"),
            KeyValue::new("service.namespace", "task1-coach"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]);
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(trace::config().with_resource(resource))
            .with_exporter(exporter)
            .install_batch(runtime::Tokio)?;
        registry.with(OpenTelemetryLayer::new(tracer)).try_init()?;
    } else {
        registry.try_init()?;
    }
    Ok(())
}

/// Trace export target; the traces-specific variable wins over the generic one.
fn otlp_endpoint() -> Option<String> {
    env_value("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT")
        .or_else(|| env_value("OTEL_EXPORTER_OTLP_ENDPOINT"))
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8888".to_string());
    Ok(raw.parse()?)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn initialize_review(http: &Client) -> anyhow::Result<ReviewService> {
    let base_url =
        env_value("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com".to_string());
    let api_key = env_value("OPENAI_API_KEY");
    if api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; chat requests will be rejected upstream");
    }
    let timeout = Duration::from_millis(env_u64("LLM_TIMEOUT_MS", 60_000));
    let chat = OpenAiClient::new(
        http.clone(),
        OpenAiConfig::new(base_url)
            .with_api_key(api_key)
            .with_timeout(timeout),
    );

    let mut config = ReviewConfig::default().with_feedback_via_batch(env_flag("FEEDBACK_VIA_BATCH"));
    if let Some(model) = env_value("FEEDBACK_MODEL") {
        config = config.with_feedback_model(model);
    }
    if let Some(model) = env_value("VISUAL_MODEL") {
        config = config.with_visual_model(model);
    }
    if let Some(model) = env_value("IMAGE_MODEL") {
        config = config.with_image_model(model);
    }
    if let Some(limit) = env_value("HELP_WORD_LIMIT").and_then(|v| v.parse::<usize>().ok()) {
        config = config.with_help_word_limit(limit);
    }
    let via_batch = config.feedback_via_batch;

    let mut review = ReviewService::new(chat.clone(), initialize_runner(http)?, config);
    if via_batch {
        let batch = BatchClient::new(chat)
            .with_poll_interval(Duration::from_millis(env_u64("BATCH_POLL_INTERVAL_MS", 5_000)))
            .with_deadline(Duration::from_secs(env_u64("BATCH_DEADLINE_SECS", 600)));
        review = review.with_batch(batch);
        info!("job feedback routed through the batch endpoint");
    }
    if let Some(content) = initialize_content(http) {
        review = review.with_content(content);
    }
    Ok(review)
}

fn initialize_runner(http: &Client) -> anyhow::Result<Arc<dyn CodeRunner>> {
    let timeout = Duration::from_millis(env_u64("SANDBOX_TIMEOUT_MS", 20_000));
    let backend = env_value("SANDBOX_BACKEND").unwrap_or_else(|| "remote".to_string());
    match backend.to_ascii_lowercase().as_str() {
        "local" => {
            let python = env_value("SANDBOX_PYTHON")
                .unwrap_or_else(|| detect_binary("python3").unwrap_or_else(|| "python3".to_string()));
            let mut config = LocalSandboxConfig::new(sandbox_root()?, python)?.with_timeout(timeout)?;
            if let Some(limit) = env_value("SANDBOX_MAX_OUTPUT_BYTES").and_then(|v| v.parse::<usize>().ok()) {
                config = config.with_max_output_bytes(limit)?;
            }
            info!(root = %config.root().display(), python = config.python(), "local sandbox enabled");
            Ok(Arc::new(LocalSandbox::new(config)))
        }
        "remote" => {
            let base_url =
                env_value("E2B_BASE_URL").unwrap_or_else(|| "https://api.e2b.dev".to_string());
            let api_key = env_value("E2B_API_KEY").unwrap_or_default();
            if api_key.is_empty() {
                warn!("E2B_API_KEY is not set; chart rendering will be unavailable");
            }
            let config = RemoteSandboxConfig::new(base_url, api_key).with_timeout(timeout);
            Ok(Arc::new(RemoteSandbox::new(http.clone(), config)))
        }
        other => anyhow::bail!("unknown SANDBOX_BACKEND '{other}' (expected remote or local)"),
    }
}

async fn initialize_store() -> anyhow::Result<JobStore> {
    let backend: Arc<dyn KeyValueStore> = match env_value("REDIS_URL") {
        Some(url) => Arc::new(RedisStore::connect(&url).await?),
        None => {
            warn!("REDIS_URL is not set; jobs are kept in process memory");
            Arc::new(MemoryStore::new())
        }
    };
    let ttl = Duration::from_secs(env_u64("JOB_TTL_SECS", 3_600));
    Ok(JobStore::new(backend).with_ttl(ttl))
}

fn initialize_content(http: &Client) -> Option<ContentClient> {
    let owner = env_value("CONTENT_OWNER")?;
    let repo = env_value("CONTENT_REPO")?;
    let mut config = ContentConfig::new(owner, repo).with_token(env_value("CONTENT_TOKEN"));
    if let Some(base_url) = env_value("CONTENT_BASE_URL") {
        config = config.with_base_url(base_url);
    }
    Some(ContentClient::new(http.clone(), config))
}

fn initialize_gallery(http: &Client) -> Option<GalleryClient> {
    let Some(token) = env_value("DROPBOX_ACCESS_TOKEN") else {
        warn!("DROPBOX_ACCESS_TOKEN is not set; image gallery disabled");
        return None;
    };
    let mut config = GalleryConfig::new(token);
    if let Some(base_url) = env_value("DROPBOX_BASE_URL") {
        config = config.with_base_url(base_url);
    }
    Some(GalleryClient::new(http.clone(), config))
}

fn sandbox_root() -> anyhow::Result<PathBuf> {
    let raw = std::env::var("SANDBOX_ROOT").unwrap_or_else(|_| "./data/sandbox".to_string());
    let path = PathBuf::from(&raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(path))
    }
}

fn detect_binary(name: &str) -> Option<String> {
    let path = std::env::var("PATH").ok()?;
    for entry in path
        .split(':')
        .map(|segment| segment.trim())
        .filter(|s| !s.is_empty())
    {
        let candidate = Path::new(entry).join(name);
        if let Ok(metadata) = std::fs::metadata(&candidate) {
            if metadata.is_file() {
                return Some(candidate.to_string_lossy().to_string());
            }
        }
    }
    None
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response()
        }
    }
}

#[derive(Debug)]
enum ApiError {
    MissingData(String),
    Invalid(String),
    NotFound(String),
    Upstream(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn outcome(&self) -> &'static str {
        match self {
            ApiError::MissingData(_) | ApiError::Invalid(_) => "invalid",
            ApiError::NotFound(_) => "not_found",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Unavailable(_) | ApiError::Internal(_) => "error",
        }
    }
}

impl From<CoachError> for ApiError {
    fn from(err: CoachError) -> Self {
        match err {
            CoachError::InvalidInput(message) => ApiError::Invalid(message),
            CoachError::JobNotFound(id) => ApiError::NotFound(format!("job '{id}' not found or expired")),
            other if other.is_upstream() => ApiError::Upstream(other.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingData(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": true, "feedback": MISSING_DATA, "message": message })),
            )
                .into_response(),
            ApiError::Invalid(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": true, "message": message })),
            )
                .into_response(),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": true, "status": "not_found", "message": message })),
            )
                .into_response(),
            ApiError::Upstream(detail) => {
                error!(%detail, "upstream service failure");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error": true,
                        "feedback": RETRY_FEEDBACK,
                        "message": "An external service failed. Please try again.",
                    })),
                )
                    .into_response()
            }
            ApiError::Unavailable(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": true, "message": message })),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                error!(%detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": true, "message": "Internal server error." })),
                )
                    .into_response()
            }
        }
    }
}

fn route_label(request: &TaskRequest) -> &'static str {
    match (request.phase, request.request_type) {
        (Some(Phase::Poll), _) => "poll",
        (Some(Phase::Submit), _) => "submit",
        (Some(Phase::SubmitAscii), _) => "submit_ascii",
        (None, Some(RequestType::Help)) => "help",
        (None, Some(RequestType::FullFeedback)) => "full_feedback",
        (None, Some(RequestType::PreloadVision)) => "preload_vision",
        (None, None) => "unknown",
    }
}

async fn handle_feedback(
    State(state): State<AppState>,
    payload: std::result::Result<Json<TaskRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    let (route, result) = match payload {
        Ok(Json(request)) => {
            let route = route_label(&request);
            (route, dispatch(&state, request).await)
        }
        Err(rejection) => ("unknown", Err(ApiError::Invalid(rejection.body_text()))),
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.outcome(),
    };
    let elapsed = start.elapsed();
    state.metrics.record_request(route, outcome, elapsed);
    info!(route, outcome, elapsed_ms = elapsed.as_millis() as u64, "request handled");

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn dispatch(state: &AppState, request: TaskRequest) -> std::result::Result<Value, ApiError> {
    if request.phase == Some(Phase::Poll) {
        return poll_job(state, request).await;
    }
    let Some(request_type) = request.request_type else {
        return Err(ApiError::MissingData("requestType is required".to_string()));
    };
    if !request.has_content() {
        return Err(ApiError::MissingData("content is required".to_string()));
    }

    match request.phase {
        Some(Phase::Submit) => return submit_job(state, request, JobKind::Diagram).await,
        Some(Phase::SubmitAscii) => return submit_job(state, request, JobKind::Ascii).await,
        Some(Phase::Poll) | None => {}
    }

    match request_type {
        RequestType::Help => {
            let feedback = state.review.feedback(RequestType::Help, &request.content).await?;
            Ok(json!({ "feedback": feedback }))
        }
        RequestType::FullFeedback => {
            let feedback = state
                .review
                .feedback(RequestType::FullFeedback, &request.content)
                .await?;
            let visualization = state.review.visualize(&request).await;
            Ok(json!({
                "feedback": feedback,
                "asciiTable": visualization.ascii_table,
                "generatedImageBase64": visualization.generated_image_base64,
                "generatedSvg": visualization.generated_svg,
                "visionAnalysisForCaching": visualization.vision_analysis,
            }))
        }
        RequestType::PreloadVision => {
            if request
                .image_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
            {
                return Err(ApiError::MissingData("imageUrl is required".to_string()));
            }
            let analysis = state.review.preload_vision(&request).await?;
            Ok(json!({ "visionAnalysis": analysis }))
        }
    }
}

async fn submit_job(
    state: &AppState,
    request: TaskRequest,
    kind: JobKind,
) -> std::result::Result<Value, ApiError> {
    let Some(task_type) = request.task_type else {
        return Err(ApiError::MissingData("taskType is required".to_string()));
    };
    let seed = match kind {
        JobKind::Ascii => request.job_id.clone(),
        JobKind::Diagram => None,
    };
    let job_request = JobRequest::new(kind, task_type, request.content)
        .with_image(request.image_url, request.image_name)
        .with_seed(seed);
    let submission = state.jobs.submit(job_request).await?;
    state.metrics.record_job(kind);
    Ok(json!({ "job_id": submission.job_id, "status": submission.status }))
}

async fn poll_job(state: &AppState, request: TaskRequest) -> std::result::Result<Value, ApiError> {
    let Some(job_id) = request.job_id.filter(|id| !id.trim().is_empty()) else {
        return Err(ApiError::MissingData("job_id is required".to_string()));
    };
    let job = state.jobs.poll(&job_id).await?;
    Ok(poll_body(&job))
}

fn poll_body(job: &Job) -> Value {
    let mut body = Map::new();
    body.insert("job_id".to_string(), json!(job.id));
    body.insert("status".to_string(), json!(job.status.as_str()));
    body.insert("type".to_string(), json!(job.kind.as_str()));
    if let Some(feedback) = &job.feedback {
        body.insert("feedback".to_string(), json!(feedback));
    }
    match &job.result {
        Some(JobResult::Diagram {
            generated_svg,
            generated_image_base64,
        }) => {
            body.insert("generatedSvg".to_string(), json!(generated_svg));
            body.insert(
                "generatedImageBase64".to_string(),
                json!(generated_image_base64),
            );
        }
        Some(JobResult::Ascii { ascii_diagram }) => {
            body.insert("asciiTable".to_string(), json!(ascii_diagram));
        }
        None => {}
    }
    if job.status == JobStatus::Failed {
        body.insert("error".to_string(), json!(true));
        body.insert(
            "message".to_string(),
            json!(job.error.as_deref().unwrap_or("job failed")),
        );
    }
    Value::Object(body)
}

#[derive(Debug, Deserialize)]
struct ImagesQuery {
    #[serde(default)]
    category: Option<String>,
}

async fn list_images(
    State(state): State<AppState>,
    Query(query): Query<ImagesQuery>,
) -> Response {
    let start = Instant::now();
    let result = gallery_listing(&state, query).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(err) => err.outcome(),
    };
    state.metrics.record_request("images", outcome, start.elapsed());
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn gallery_listing(
    state: &AppState,
    query: ImagesQuery,
) -> std::result::Result<Value, ApiError> {
    let Some(category) = query.category.filter(|c| !c.trim().is_empty()) else {
        return Err(ApiError::Invalid("Category parameter is required".to_string()));
    };
    let Some(gallery) = &state.gallery else {
        return Err(ApiError::Unavailable("Dropbox not configured".to_string()));
    };
    let listing = gallery.list(category.trim()).await?;
    serde_json::to_value(listing).map_err(|err| ApiError::Internal(err.to_string()))
}
