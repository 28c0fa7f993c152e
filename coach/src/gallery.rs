//! Sample visuals per task type, listed from a Dropbox folder and exposed as
//! direct-download links.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{CoachError, Result};
use crate::task::TaskType;
use crate::upstream::{endpoint, read_json};

const SERVICE: &str = "gallery";
const IMAGE_EXTENSIONS: [&str; 4] = [".jpg", ".jpeg", ".png", ".gif"];

#[derive(Debug, Clone)]
pub struct GalleryConfig {
    pub base_url: String,
    pub access_token: String,
    pub page_limit: u32,
    pub request_timeout: Duration,
}

impl GalleryConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.dropboxapi.com/2".to_string(),
            access_token: access_token.into(),
            page_limit: 100,
            request_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GalleryImage {
    pub name: String,
    pub url: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GalleryListing {
    pub category: TaskType,
    pub images: Vec<GalleryImage>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct FolderListing {
    #[serde(default)]
    entries: Vec<FolderEntry>,
}

#[derive(Debug, Deserialize)]
struct FolderEntry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_lower: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SharedLinks {
    #[serde(default)]
    links: Vec<SharedLink>,
}

#[derive(Debug, Deserialize)]
struct SharedLink {
    url: String,
}

#[derive(Clone)]
pub struct GalleryClient {
    http: reqwest::Client,
    config: GalleryConfig,
}

impl GalleryClient {
    pub fn new(http: reqwest::Client, config: GalleryConfig) -> Self {
        Self { http, config }
    }

    async fn call<T: DeserializeOwned>(&self, route: &str, body: Value) -> Result<T> {
        let response = self
            .http
            .post(endpoint(&self.config.base_url, route))
            .bearer_auth(&self.config.access_token)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(CoachError::network)?;
        read_json(SERVICE, response).await
    }

    pub async fn list(&self, category: &str) -> Result<GalleryListing> {
        let task = TaskType::parse(category)
            .ok_or_else(|| CoachError::InvalidInput("Invalid category".to_string()))?;

        let listing: FolderListing = self
            .call(
                "/files/list_folder",
                json!({ "path": task.folder(), "limit": self.config.page_limit }),
            )
            .await?;

        let mut images = Vec::new();
        for entry in listing.entries.into_iter().filter(is_image_file) {
            let path = entry
                .path_lower
                .clone()
                .unwrap_or_else(|| format!("{}/{}", task.folder(), entry.name.to_lowercase()));
            match self.shared_link(&path).await {
                Ok(url) => images.push(GalleryImage {
                    name: entry.name,
                    url: direct_link(&url),
                    path,
                }),
                Err(err) => warn!(file = %entry.name, error = %err, "skipping image without shared link"),
            }
        }
        debug!(category = %task, count = images.len(), "gallery listed");

        Ok(GalleryListing {
            category: task,
            count: images.len(),
            images,
        })
    }

    async fn shared_link(&self, path: &str) -> Result<String> {
        let existing: SharedLinks = self
            .call(
                "/sharing/list_shared_links",
                json!({ "path": path, "direct_only": true }),
            )
            .await?;
        if let Some(link) = existing.links.into_iter().next() {
            return Ok(link.url);
        }
        let created: SharedLink = self
            .call(
                "/sharing/create_shared_link_with_settings",
                json!({ "path": path, "settings": { "requested_visibility": "public" } }),
            )
            .await?;
        Ok(created.url)
    }
}

fn is_image_file(entry: &FolderEntry) -> bool {
    let name = entry.name.to_lowercase();
    entry.tag == "file" && IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Shared-page link rewritten to the raw content host.
pub fn direct_link(url: &str) -> String {
    url.replacen("www.dropbox.com", "dl.dropboxusercontent.com", 1)
        .replacen("?dl=0", "", 1)
}
