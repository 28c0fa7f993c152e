//! Feedback and visualization pipeline built on the gateways.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch::BatchClient;
use crate::chat::{ChatRequest, ImageRequest, OpenAiClient};
use crate::content::{analysis_path, ContentClient};
use crate::errors::{CoachError, Result};
use crate::exec::{wrap_chart_script, CodeRunner};
use crate::jobs::{Job, JobKind, JobResult, JobWorker};
use crate::map_sketch;
use crate::sanitize::{clean_chart_code, clip_words, extract_svg, extract_table, strip_fences};
use crate::task::{RequestType, TaskRequest, TaskType};

const EXAMINER_SYSTEM: &str = "IELTS Writing Task 1 examiner.";
const VISION_PROMPT: &str = "Analyze this IELTS map briefly:

1. Structure: before/after or single view?
2. Count each feature type (trees, huts, buildings)
3. Main areas: water, beach, land positions
4. Key colors used

Be concise - just the facts needed for visualization.";
const SVG_SYSTEM: &str = "Create accurate SVG. Output only SVG code, no markdown.";
const SVG_TEMPLATE: &str = r##"SVG STRUCTURE:
<svg viewBox="0 0 1000 700" xmlns="http://www.w3.org/2000/svg">
  <!-- Before (top half, y=50-300) -->
  <g id="before">
    <text x="500" y="30" font-size="20" font-weight="bold" text-anchor="middle">Before</text>
  </g>
  <!-- After (bottom half, y=400-650) -->
  <g id="after" transform="translate(0,350)">
    <text x="500" y="30" font-size="20" font-weight="bold" text-anchor="middle">After</text>
  </g>
</svg>

QUICK REFERENCE:
- Trees: <circle cx="X" cy="Y" r="15" fill="#228B22"/>
- Huts: <rect x="X" y="Y" width="50" height="40" fill="#8B4513"/>
- Water: bottom area, fill="#87CEEB"
- Beach: above water, fill="#F5DEB3"

Match the analysis feature counts. Output ONLY SVG code."##;
const IMAGE_PROMPT_LIMIT: usize = 3800;

#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub feedback_model: String,
    pub visual_model: String,
    pub image_model: String,
    pub image_size: String,
    pub feedback_via_batch: bool,
    /// Upper bound on the words returned for a `help` request.
    pub help_word_limit: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            feedback_model: "gpt-4o-mini".to_string(),
            visual_model: "gpt-4o".to_string(),
            image_model: "gpt-image-1".to_string(),
            image_size: "1024x1024".to_string(),
            feedback_via_batch: false,
            help_word_limit: 150,
        }
    }
}

impl ReviewConfig {
    pub fn with_feedback_model(mut self, model: impl Into<String>) -> Self {
        self.feedback_model = model.into();
        self
    }

    pub fn with_visual_model(mut self, model: impl Into<String>) -> Self {
        self.visual_model = model.into();
        self
    }

    pub fn with_image_model(mut self, model: impl Into<String>) -> Self {
        self.image_model = model.into();
        self
    }

    pub fn with_feedback_via_batch(mut self, enabled: bool) -> Self {
        self.feedback_via_batch = enabled;
        self
    }

    pub fn with_help_word_limit(mut self, limit: usize) -> Self {
        self.help_word_limit = limit.max(1);
        self
    }
}

/// Best-effort artifacts for one submission; absent pieces stay `None`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Visualization {
    pub ascii_table: Option<String>,
    pub generated_image_base64: Option<String>,
    pub generated_svg: Option<String>,
    #[serde(rename = "visionAnalysisForCaching")]
    pub vision_analysis: Option<String>,
}

#[derive(Clone)]
pub struct ReviewService {
    chat: OpenAiClient,
    runner: Arc<dyn CodeRunner>,
    batch: Option<BatchClient>,
    content: Option<ContentClient>,
    config: ReviewConfig,
}

impl ReviewService {
    pub fn new(chat: OpenAiClient, runner: Arc<dyn CodeRunner>, config: ReviewConfig) -> Self {
        Self {
            chat,
            runner,
            batch: None,
            content: None,
            config,
        }
    }

    pub fn with_batch(mut self, batch: BatchClient) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_content(mut self, content: ContentClient) -> Self {
        self.content = Some(content);
        self
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    fn feedback_request(&self, request_type: RequestType, content: &str) -> ChatRequest {
        let prompt = match request_type {
            RequestType::Help => format!(
                "IELTS examiner: Give short hints (< {} words) for:\n\n{content}",
                self.config.help_word_limit
            ),
            RequestType::FullFeedback | RequestType::PreloadVision => format!(
                "IELTS Task 1 examiner: Evaluate on Task Achievement, Coherence/Cohesion, Lexical Resource, Grammar. Bold section titles.\n\n{content}"
            ),
        };
        ChatRequest::new(&self.config.feedback_model)
            .system(EXAMINER_SYSTEM)
            .user(prompt)
    }

    /// Examiner feedback: short hints for `help`, four-criteria review otherwise.
    pub async fn feedback(&self, request_type: RequestType, content: &str) -> Result<String> {
        if content.trim().is_empty() {
            return Err(CoachError::InvalidInput("content must not be empty".to_string()));
        }
        let feedback = self
            .chat
            .complete(&self.feedback_request(request_type, content))
            .await?;
        Ok(match request_type {
            RequestType::Help => clip_words(&feedback, self.config.help_word_limit),
            RequestType::FullFeedback | RequestType::PreloadVision => feedback,
        })
    }

    async fn job_feedback(&self, job: &Job) -> Result<String> {
        let request = self.feedback_request(RequestType::FullFeedback, &job.content);
        match (&self.batch, self.config.feedback_via_batch) {
            (Some(batch), true) => batch.run_chat(&job.id, &request).await,
            _ => self.chat.complete(&request).await,
        }
    }

    /// Regenerates the visual matching the task type. Never fails: each
    /// unavailable artifact is logged and left empty.
    pub async fn visualize(&self, request: &TaskRequest) -> Visualization {
        let mut visualization = Visualization::default();
        let Some(task) = request.task_type else {
            return visualization;
        };
        let content = request.content.as_str();

        match task {
            TaskType::Table => match self.ascii_table(content).await {
                Ok(table) => visualization.ascii_table = Some(table),
                Err(err) => warn!(task = %task, error = %err, "ascii table unavailable"),
            },
            TaskType::LineGraph | TaskType::BarChart | TaskType::PieChart => {
                match self.chart_image(task, content).await {
                    Ok(image) => visualization.generated_image_base64 = image,
                    Err(err) => warn!(task = %task, error = %err, "chart image unavailable"),
                }
            }
            TaskType::Flowchart | TaskType::Maps => {
                let analysis = match self
                    .vision_analysis(task, request.image_url.as_deref(), request.image_name.as_deref())
                    .await
                {
                    Ok(analysis) => analysis,
                    Err(err) => {
                        warn!(task = %task, error = %err, "vision analysis unavailable");
                        None
                    }
                };
                match self.diagram_svg(content, analysis.as_deref()).await {
                    Ok(svg) => visualization.generated_svg = svg,
                    Err(err) => warn!(task = %task, error = %err, "svg unavailable"),
                }
                if visualization.generated_svg.is_none() && task == TaskType::Maps {
                    visualization.generated_svg = Some(map_sketch::render(content));
                }
                visualization.vision_analysis = analysis;
            }
        }
        visualization
    }

    /// Vision analysis for the referenced image, for the operator to cache.
    pub async fn preload_vision(&self, request: &TaskRequest) -> Result<String> {
        let task = request.task_type.unwrap_or(TaskType::Maps);
        if request.image_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
            return Err(CoachError::InvalidInput("imageUrl is required".to_string()));
        }
        self.vision_analysis(task, request.image_url.as_deref(), request.image_name.as_deref())
            .await?
            .ok_or_else(|| CoachError::MalformedResponse {
                service: "chat",
                detail: "vision analysis came back empty".to_string(),
            })
    }

    async fn ascii_table(&self, content: &str) -> Result<String> {
        let request = ChatRequest::new(&self.config.feedback_model)
            .system("Convert to ASCII table with | borders.")
            .user(format!("ASCII table only:\n\n{content}"));
        let reply = self.chat.complete(&request).await?;
        Ok(extract_table(&reply).unwrap_or_else(|| strip_fences(&reply)))
    }

    async fn ascii_diagram(&self, task: TaskType, content: &str) -> Result<String> {
        if task == TaskType::Table {
            return self.ascii_table(content).await;
        }
        let request = ChatRequest::new(&self.config.feedback_model)
            .system(format!("Convert to a plain ASCII {task} diagram using boxes and arrows."))
            .user(format!("ASCII diagram only:\n\n{content}"));
        let reply = self.chat.complete(&request).await?;
        let diagram = strip_fences(&reply);
        if diagram.is_empty() {
            return Err(CoachError::MalformedResponse {
                service: "chat",
                detail: "empty ascii diagram".to_string(),
            });
        }
        Ok(diagram)
    }

    async fn chart_image(&self, task: TaskType, content: &str) -> Result<Option<String>> {
        let prompt = format!(
            "Generate Python matplotlib code for {task}:\n\n{content}\n\nRequirements:\n- Extract data accurately\n- Use matplotlib.pyplot as plt\n- figsize=(10,6)\n- Include title, labels, legend\n- Return ONLY code"
        );
        let request = ChatRequest::new(&self.config.visual_model)
            .system("Generate Python code only.")
            .user(prompt)
            .with_temperature(0.2);
        let reply = self.chat.complete(&request).await?;
        let code = clean_chart_code(&reply);
        if code.is_empty() {
            return Ok(None);
        }
        let output = self.runner.run_python(&wrap_chart_script(&code)).await?;
        if output.png.is_none() {
            warn!(task = %task, "chart script produced no figure");
        }
        Ok(output.png_data_url())
    }

    async fn cached_analysis(&self, task: TaskType, image_name: Option<&str>) -> Option<String> {
        let (content, name) = (self.content.as_ref()?, image_name?);
        let path = analysis_path(task, name);
        match content.fetch_text(&path).await {
            Ok(Some(text)) if !text.trim().is_empty() => {
                info!(path = %path, "loaded cached vision analysis");
                Some(text)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(path = %path, error = %err, "vision cache lookup failed");
                None
            }
        }
    }

    /// Cached analysis when available, otherwise a vision call on the image.
    /// `None` when there is neither a cache entry nor an image to look at.
    async fn vision_analysis(
        &self,
        task: TaskType,
        image_url: Option<&str>,
        image_name: Option<&str>,
    ) -> Result<Option<String>> {
        if let Some(cached) = self.cached_analysis(task, image_name).await {
            return Ok(Some(cached));
        }
        let Some(url) = image_url.filter(|url| !url.trim().is_empty()) else {
            return Ok(None);
        };
        let request = ChatRequest::new(&self.config.visual_model)
            .user_with_image(VISION_PROMPT, url)
            .with_max_tokens(600)
            .with_temperature(0.1);
        let analysis = self.chat.complete(&request).await?;
        info!(task = %task, chars = analysis.len(), "vision analysis complete");
        Ok(Some(analysis))
    }

    async fn diagram_svg(&self, content: &str, analysis: Option<&str>) -> Result<Option<String>> {
        let analysis = analysis.unwrap_or("(no image analysis available)");
        let prompt = format!(
            "Create accurate SVG from this analysis:\n\nIMAGE ANALYSIS:\n{analysis}\n\nSTUDENT DESCRIPTION:\n{content}\n\n{SVG_TEMPLATE}"
        );
        let request = ChatRequest::new(&self.config.visual_model)
            .system(SVG_SYSTEM)
            .user(prompt)
            .with_temperature(0.2)
            .with_max_tokens(2500);
        let reply = self.chat.complete(&request).await?;
        Ok(extract_svg(&reply))
    }

    async fn generated_image(
        &self,
        task: TaskType,
        content: &str,
        analysis: Option<&str>,
    ) -> Result<String> {
        let mut prompt = format!(
            "Clean, labelled IELTS Writing Task 1 {task} on a white background, drawn as a simple diagram.\n\nStudent description:\n{content}"
        );
        if let Some(analysis) = analysis {
            prompt.push_str("\n\nReference analysis:\n");
            prompt.push_str(analysis);
        }
        let prompt: String = prompt.chars().take(IMAGE_PROMPT_LIMIT).collect();
        let request = ImageRequest::new(&self.config.image_model, prompt)
            .with_size(self.config.image_size.clone());
        Ok(self.chat.generate_image(&request).await?.into_src())
    }

    async fn render_diagram(&self, job: &Job) -> Result<JobResult> {
        let analysis = self
            .vision_analysis(job.task_type, job.image_url.as_deref(), job.image_name.as_deref())
            .await?;
        if let Some(svg) = self.diagram_svg(&job.content, analysis.as_deref()).await? {
            return Ok(JobResult::Diagram {
                generated_svg: Some(svg),
                generated_image_base64: None,
            });
        }
        info!(job_id = %job.id, "no svg in reply, falling back to image generation");
        match self
            .generated_image(job.task_type, &job.content, analysis.as_deref())
            .await
        {
            Ok(image) => Ok(JobResult::Diagram {
                generated_svg: None,
                generated_image_base64: Some(image),
            }),
            Err(err) if job.task_type == TaskType::Maps => {
                warn!(job_id = %job.id, error = %err, "image generation failed, sketching map");
                Ok(JobResult::Diagram {
                    generated_svg: Some(map_sketch::render(&job.content)),
                    generated_image_base64: None,
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl JobWorker for ReviewService {
    async fn feedback(&self, job: &Job) -> Result<String> {
        self.job_feedback(job).await
    }

    async fn render(&self, job: &Job) -> Result<JobResult> {
        match job.kind {
            JobKind::Diagram => self.render_diagram(job).await,
            JobKind::Ascii => Ok(JobResult::Ascii {
                ascii_diagram: self.ascii_diagram(job.task_type, &job.content).await?,
            }),
        }
    }
}
