use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coach::exec::CodeRunner;
use coach::jobs::{JobKind, JobRequest, JobResult, JobStatus};
use coach::{
    CoachError, LocalSandbox, LocalSandboxConfig, RequestType, TaskRequest, TaskType,
};
use integration_tests::support::{
    chat_mock, content_client, mount_sandbox, orchestrator, review_service, temp_workspace,
    wait_for_terminal,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FULL_FEEDBACK_MARKER: &str = "Evaluate on Task Achievement";

#[tokio::test]
async fn bar_chart_full_feedback_with_rendered_chart() -> Result<()> {
    let server = MockServer::start().await;
    chat_mock(FULL_FEEDBACK_MARKER, "**Task Achievement**\nCovers the key rise.")
        .expect(1)
        .mount(&server)
        .await;
    chat_mock(
        "matplotlib code for bar-chart",
        "```python\nimport matplotlib.pyplot as plt\nplt.bar(['2000', '2010'], [10, 50])\nplt.show()\n```",
    )
    .expect(1)
    .mount(&server)
    .await;
    mount_sandbox(&server, "BASE64_STARTiVBORw0KGgoAAAANSUhEUg==BASE64_END\n").await;

    let review = review_service(&server);
    let request = TaskRequest::new(
        RequestType::FullFeedback,
        TaskType::BarChart,
        "Sales rose from 10 to 50 between 2000 and 2010",
    );
    let feedback = review
        .feedback(RequestType::FullFeedback, &request.content)
        .await?;
    let visualization = review.visualize(&request).await;

    assert!(feedback.contains("**Task Achievement**"));
    assert_eq!(
        visualization.generated_image_base64.as_deref(),
        Some("data:image/png;base64,iVBORw0KGgoAAAANSUhEUg==")
    );
    assert!(visualization.ascii_table.is_none());
    assert!(visualization.generated_svg.is_none());
    Ok(())
}

#[tokio::test]
async fn help_request_returns_short_feedback_only() -> Result<()> {
    let server = MockServer::start().await;
    chat_mock("short hints", "Group the data by year and add an overview.")
        .expect(1)
        .mount(&server)
        .await;

    let review = review_service(&server);
    let feedback = review.feedback(RequestType::Help, "The table shows sales.").await?;
    assert_eq!(feedback, "Group the data by year and add an overview.");
    Ok(())
}

#[tokio::test]
async fn map_job_then_ascii_retry_reuses_feedback() -> Result<()> {
    let server = MockServer::start().await;
    chat_mock(FULL_FEEDBACK_MARKER, "**Coherence**\nWell organised.")
        .expect(1)
        .mount(&server)
        .await;
    chat_mock("Analyze this IELTS map", "Before/after. 2 huts then 5 huts.")
        .mount(&server)
        .await;
    chat_mock(
        "2 huts then 5 huts",
        "<svg viewBox=\"0 0 1000 700\"><g id=\"before\"/><g id=\"after\"/></svg>",
    )
    .mount(&server)
    .await;
    chat_mock("ASCII diagram only", "```\n[Huts x2] -> [Huts x5, Pier]\n```")
        .mount(&server)
        .await;

    let jobs = orchestrator(Arc::new(review_service(&server)));
    let submitted = jobs
        .submit(
            JobRequest::new(JobKind::Diagram, TaskType::Maps, "Three huts and a pier were added.")
                .with_image(
                    Some("https://images.example/island.png".to_string()),
                    Some("island.png".to_string()),
                ),
        )
        .await?;
    assert_eq!(submitted.status, "submitted");

    let diagram = wait_for_terminal(&jobs, &submitted.job_id).await?;
    assert_eq!(diagram.status, JobStatus::Completed);
    assert_eq!(diagram.feedback.as_deref(), Some("**Coherence**\nWell organised."));
    assert_eq!(
        diagram.result,
        Some(JobResult::Diagram {
            generated_svg: Some(
                "<svg viewBox=\"0 0 1000 700\"><g id=\"before\"/><g id=\"after\"/></svg>".to_string()
            ),
            generated_image_base64: None,
        })
    );
    assert_eq!(jobs.poll(&submitted.job_id).await?, diagram);

    let retry = jobs
        .submit(
            JobRequest::new(JobKind::Ascii, TaskType::Maps, "Three huts and a pier were added.")
                .with_seed(Some(submitted.job_id.clone())),
        )
        .await?;
    let ascii = wait_for_terminal(&jobs, &retry.job_id).await?;
    assert_eq!(ascii.status, JobStatus::Completed);
    assert_eq!(ascii.feedback, diagram.feedback);
    assert_eq!(
        ascii.result,
        Some(JobResult::Ascii {
            ascii_diagram: "[Huts x2] -> [Huts x5, Pier]".to_string()
        })
    );
    Ok(())
}

#[tokio::test]
async fn cached_analysis_skips_vision_call() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/coach/visuals/contents/visuals/maps/island.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": "QmVmb3JlOiAyIGh1dHMuIEFmdGVy\nOiA1IGh1dHMgYW5kIGEgcGllci4=\n",
            "encoding": "base64"
        })))
        .mount(&server)
        .await;
    chat_mock("Analyze this IELTS map", "should not be used")
        .expect(0)
        .mount(&server)
        .await;
    chat_mock("5 huts and a pier", "<svg viewBox=\"0 0 1000 700\"></svg>")
        .mount(&server)
        .await;

    let review = review_service(&server).with_content(content_client(&server));
    let mut request = TaskRequest::new(RequestType::FullFeedback, TaskType::Maps, "Huts were added.");
    request.image_url = Some("https://images.example/island.png".to_string());
    request.image_name = Some("island.png".to_string());

    let visualization = review.visualize(&request).await;
    assert_eq!(
        visualization.vision_analysis.as_deref(),
        Some("Before: 2 huts. After: 5 huts and a pier.")
    );
    assert_eq!(
        visualization.generated_svg.as_deref(),
        Some("<svg viewBox=\"0 0 1000 700\"></svg>")
    );
    Ok(())
}

#[tokio::test]
async fn failed_render_keeps_feedback_on_job() -> Result<()> {
    let server = MockServer::start().await;
    chat_mock(FULL_FEEDBACK_MARKER, "**Grammar**\nMostly accurate.")
        .mount(&server)
        .await;
    chat_mock("Create accurate SVG", "I cannot produce that.")
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/images/generations"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "image backend down" }
        })))
        .mount(&server)
        .await;

    let jobs = orchestrator(Arc::new(review_service(&server)));
    let submitted = jobs
        .submit(JobRequest::new(JobKind::Diagram, TaskType::Flowchart, "Clay is dug then fired."))
        .await?;
    let job = wait_for_terminal(&jobs, &submitted.job_id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.feedback.as_deref(), Some("**Grammar**\nMostly accurate."));
    assert!(job.result.is_none());
    assert!(job.error.is_some());
    Ok(())
}

#[tokio::test]
async fn upstream_errors_surface_as_gateway_failures() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let review = review_service(&server);
    let err = review
        .feedback(RequestType::Help, "draft")
        .await
        .expect_err("chat is down");
    assert!(err.is_upstream());

    let err = review
        .feedback(RequestType::Help, "   ")
        .await
        .expect_err("empty content");
    assert!(matches!(err, CoachError::InvalidInput(_)));
    Ok(())
}

#[tokio::test]
async fn local_sandbox_decodes_marked_output() -> Result<()> {
    let python = std::env::var("PATH").ok().and_then(|paths| {
        paths
            .split(':')
            .map(|dir| std::path::Path::new(dir).join("python3"))
            .find(|candidate| candidate.is_file())
    });
    let Some(python) = python else {
        return Ok(());
    };
    let workspace = temp_workspace()?;
    let config = LocalSandboxConfig::new(workspace.path(), python.to_string_lossy())?
        .with_timeout(Duration::from_secs(20))?;
    let sandbox = LocalSandbox::new(config);

    let output = sandbox
        .run_python("print('BASE64_START' + 'iVBORw0K' + 'BASE64_END')")
        .await?;
    assert_eq!(output.png_data_url().as_deref(), Some("data:image/png;base64,iVBORw0K"));
    assert_eq!(std::fs::read_dir(workspace.path())?.count(), 0);
    Ok(())
}
