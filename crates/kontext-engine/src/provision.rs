//! One-time download of the pipeline weights from the model hub.
//!
//! The whole fetch is retried on transient transport or filesystem errors,
//! up to [`ProvisionConfig::max_attempts`] attempts. Files already in the
//! cache with the expected size are not downloaded again.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::config::ProvisionConfig;

const MODEL_INDEX: &str = "model_index.json";

#[derive(Debug, thiserror::Error)]
#[error("hub request failed ({status}): {url}")]
pub struct HubStatusError {
    pub url: String,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoFile {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub lfs: Option<LfsInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LfsInfo {
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RepoFile {
    fn expected_size(&self) -> Option<u64> {
        self.lfs.as_ref().and_then(|lfs| lfs.size).or(self.size)
    }
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub model_dir: PathBuf,
    pub downloaded: usize,
    pub skipped: usize,
}

pub struct Provisioner {
    config: ProvisionConfig,
    http: HttpClient,
}

impl Provisioner {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.config.cache_dir.join(&self.config.model_id)
    }

    pub fn fetch(&self) -> Result<ProvisionReport> {
        if self.config.hf_token.is_some() {
            tracing::info!("using Hugging Face token from HF_TOKEN");
        } else {
            tracing::warn!("HF_TOKEN not set; gated repositories will refuse the download");
        }
        let attempts = self.config.max_attempts.max(1);
        retry_transient(attempts, self.config.retry_backoff_s, |attempt| {
            tracing::info!(
                model = %self.config.model_id,
                attempt,
                attempts,
                "fetching model weights"
            );
            self.fetch_once()
        })
    }

    fn fetch_once(&self) -> Result<ProvisionReport> {
        let files = self.list_files()?;
        let model_dir = self.model_dir();
        let mut report = ProvisionReport {
            model_dir: model_dir.clone(),
            ..ProvisionReport::default()
        };
        for file in files.iter().filter(|file| wanted(&file.rfilename)) {
            let dest = safe_join(&model_dir, &file.rfilename)?;
            if is_cached(&dest, file.expected_size()) {
                report.skipped += 1;
                continue;
            }
            self.download(file, &dest)?;
            report.downloaded += 1;
        }
        tracing::info!(
            dir = %model_dir.display(),
            downloaded = report.downloaded,
            skipped = report.skipped,
            "model weights ready"
        );
        Ok(report)
    }

    fn list_files(&self) -> Result<Vec<RepoFile>> {
        let url = format!(
            "{}/api/models/{}?blobs=true",
            self.config.hub_base, self.config.model_id
        );
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .with_context(|| format!("hub listing failed ({url})"))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(HubStatusError { url, status }.into());
        }
        let info: RepoInfo = response
            .json()
            .context("hub listing returned invalid JSON")?;
        if info.siblings.is_empty() {
            bail!("hub listing for {} has no files", self.config.model_id);
        }
        Ok(info.siblings)
    }

    fn download(&self, file: &RepoFile, dest: &Path) -> Result<()> {
        let url = format!(
            "{}/{}/resolve/main/{}",
            self.config.hub_base, self.config.model_id, file.rfilename
        );
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut response = self
            .authorized(self.http.get(&url))
            .timeout(Duration::from_secs(3600))
            .send()
            .with_context(|| format!("download failed ({url})"))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(HubStatusError { url, status }.into());
        }

        let partial = dest.with_extension("part");
        let mut out = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        response
            .copy_to(&mut out)
            .with_context(|| format!("download interrupted ({url})"))?;
        drop(out);

        if let Some(lfs) = &file.lfs {
            let actual = sha256_file(&partial)?;
            if !actual.eq_ignore_ascii_case(&lfs.sha256) {
                let _ = fs::remove_file(&partial);
                bail!(
                    "checksum mismatch for {}: expected {}, got {actual}",
                    file.rfilename,
                    lfs.sha256
                );
            }
        }
        fs::rename(&partial, dest)
            .with_context(|| format!("failed to move {} into place", dest.display()))?;
        tracing::debug!(file = %file.rfilename, "downloaded");
        Ok(())
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.hf_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
/// `op` receives the 1-based attempt number.
pub fn retry_transient<T>(
    max_attempts: usize,
    backoff_s: f64,
    mut op: impl FnMut(usize) -> Result<T>,
) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                tracing::warn!(
                    "error encountered: {err:#}; retrying attempt {} of {max_attempts}",
                    attempt + 1
                );
                thread::sleep(Duration::from_secs_f64(backoff_s * attempt as f64));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Network hiccups, throttling, server errors and local I/O failures.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
            return http_err.is_timeout()
                || http_err.is_connect()
                || http_err.is_request()
                || http_err.is_body();
        }
        if let Some(status_err) = cause.downcast_ref::<HubStatusError>() {
            return status_err.status == 429 || status_err.status >= 500;
        }
        cause.downcast_ref::<io::Error>().is_some()
    })
}

/// Pipeline component files live in subfolders; the root only contributes
/// the pipeline index. Root-level single-file checkpoints are skipped.
pub fn wanted(rfilename: &str) -> bool {
    rfilename == MODEL_INDEX || (rfilename.contains('/') && !rfilename.starts_with('.'))
}

fn safe_join(root: &Path, rfilename: &str) -> Result<PathBuf> {
    let relative = Path::new(rfilename);
    if relative
        .components()
        .any(|part| !matches!(part, Component::Normal(_)))
    {
        bail!("refusing unsafe repository path {rfilename}");
    }
    Ok(root.join(relative))
}

fn is_cached(path: &Path, expected_size: Option<u64>) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    meta.is_file() && expected_size.map_or(true, |size| meta.len() == size)
}

fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::new(file), &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
