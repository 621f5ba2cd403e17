use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbImage;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::config::{BucketConfig, HandlerConfig};
use crate::workspace::JobWorkspace;

pub const OUTPUT_FILE_NAME: &str = "output.png";

/// Remote storage for finished images.
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `path` under the job's prefix and returns its URL.
    fn upload(&self, job_id: &str, path: &Path) -> Result<String>;
}

/// Stores objects with a plain `PUT {endpoint}/{job_id}/{file}`.
pub struct HttpObjectStore {
    endpoint: String,
    access_token: Option<String>,
    timeout_s: f64,
    http: HttpClient,
}

impl HttpObjectStore {
    pub fn new(bucket: &BucketConfig, timeout_s: f64) -> Self {
        Self {
            endpoint: bucket.endpoint_url.clone(),
            access_token: bucket.access_token.clone(),
            timeout_s,
            http: HttpClient::new(),
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn upload(&self, job_id: &str, path: &Path) -> Result<String> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(OUTPUT_FILE_NAME);
        let url = format!("{}/{}/{}", self.endpoint, job_id, file_name);
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;

        let mut request = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, "image/png")
            .timeout(Duration::from_secs_f64(self.timeout_s))
            .body(bytes);
        if let Some(token) = &self.access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request
            .send()
            .with_context(|| format!("upload failed ({url})"))?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            bail!("upload failed ({}): {}", status.as_u16(), body.trim());
        }
        // Stores that sign or rewrite URLs answer with {"url": ...}.
        let signed = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|payload| payload.get("url").and_then(Value::as_str).map(str::to_string));
        Ok(signed.unwrap_or(url))
    }
}

/// Turns a generated image into the reference returned to the caller.
pub struct Materializer {
    store: Option<Box<dyn ObjectStore>>,
}

impl Materializer {
    pub fn inline() -> Self {
        Self { store: None }
    }

    pub fn with_store(store: impl ObjectStore + 'static) -> Self {
        Self {
            store: Some(Box::new(store)),
        }
    }

    pub fn from_config(config: &HandlerConfig) -> Self {
        match &config.bucket {
            Some(bucket) => {
                Self::with_store(HttpObjectStore::new(bucket, config.request_timeout_s))
            }
            None => Self::inline(),
        }
    }

    pub fn uploads(&self) -> bool {
        self.store.is_some()
    }

    /// Saves `image` into the workspace, uploads it or encodes it inline,
    /// then deletes the workspace whatever the outcome.
    pub fn materialize(
        &self,
        image: &RgbImage,
        job_id: &str,
        workspace: JobWorkspace,
    ) -> Result<String> {
        let reference = self.reference_for(image, job_id, &workspace);
        if let Err(err) = workspace.remove() {
            tracing::warn!(job_id, "{err:#}");
        }
        reference
    }

    fn reference_for(
        &self,
        image: &RgbImage,
        job_id: &str,
        workspace: &JobWorkspace,
    ) -> Result<String> {
        let path = workspace.join(OUTPUT_FILE_NAME);
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        if let Some(store) = &self.store {
            let url = store.upload(job_id, &path)?;
            tracing::debug!(job_id, url = %url, "image uploaded");
            return Ok(url);
        }
        let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(format!("data:image/png;base64,{}", BASE64.encode(bytes)))
    }
}
