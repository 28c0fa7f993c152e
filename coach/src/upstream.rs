use reqwest::Response;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{CoachError, Result};

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Reads the body and fails with `Upstream` on a non-success status.
pub(crate) async fn read_body(service: &'static str, response: Response) -> Result<Vec<u8>> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(CoachError::network)?;
    if status.is_success() {
        return Ok(bytes.to_vec());
    }
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    let message = error_message(&body)
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(&bytes).trim().to_string();
            if text.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                text
            }
        });
    Err(CoachError::Upstream {
        service,
        status: status.as_u16(),
        message,
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    service: &'static str,
    response: Response,
) -> Result<T> {
    let bytes = read_body(service, response).await?;
    serde_json::from_slice(&bytes).map_err(|err| CoachError::MalformedResponse {
        service,
        detail: err.to_string(),
    })
}

/// OpenAI style `{"error": {"message": ..}}`, plain `{"error": ".."}`, or
/// Dropbox style `{"error_summary": ".."}`.
fn error_message(body: &Value) -> Option<String> {
    let candidate = body
        .pointer("/error/message")
        .or_else(|| body.get("error_summary"))
        .or_else(|| body.get("message"))
        .or_else(|| body.get("error"))?;
    candidate
        .as_str()
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn joins_endpoints() {
        assert_eq!(
            endpoint("http://host/", "/v1/chat/completions"),
            "http://host/v1/chat/completions"
        );
        assert_eq!(endpoint("http://host", "files"), "http://host/files");
    }

    #[test]
    fn picks_error_messages() {
        assert_eq!(
            error_message(&json!({ "error": { "message": "bad key" } })).as_deref(),
            Some("bad key")
        );
        assert_eq!(
            error_message(&json!({ "error_summary": "path/not_found/" })).as_deref(),
            Some("path/not_found/")
        );
        assert_eq!(error_message(&json!({ "error": "" })), None);
        assert_eq!(error_message(&Value::Null), None);
    }
}
