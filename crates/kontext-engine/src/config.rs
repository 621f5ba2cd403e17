use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};

pub const DEFAULT_MODEL_ID: &str = "black-forest-labs/FLUX.1-Kontext-dev";
pub const DEFAULT_HUB_BASE: &str = "https://huggingface.co";
pub const PROVISION_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Dryrun,
    Remote,
}

impl FromStr for ModelBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dryrun" => Ok(Self::Dryrun),
            "remote" => Ok(Self::Remote),
            other => bail!("unknown model backend '{other}' (expected dryrun or remote)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub endpoint_url: String,
    pub access_token: Option<String>,
}

/// Settings read once at worker startup.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    pub work_dir: PathBuf,
    pub model: ModelBackend,
    pub inference_url: Option<String>,
    pub request_timeout_s: f64,
    /// Present when `BUCKET_ENDPOINT_URL` is set; selects upload over inline data URIs.
    pub bucket: Option<BucketConfig>,
    pub events_path: Option<PathBuf>,
}

impl HandlerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let model = match lookup("KONTEXT_MODEL") {
            Some(raw) => raw.parse()?,
            None => ModelBackend::Dryrun,
        };
        let inference_url = lookup("KONTEXT_INFERENCE_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string());
        if model == ModelBackend::Remote && inference_url.is_none() {
            bail!("KONTEXT_MODEL=remote requires KONTEXT_INFERENCE_URL");
        }
        let bucket = lookup("BUCKET_ENDPOINT_URL").map(|endpoint| BucketConfig {
            endpoint_url: endpoint.trim().trim_end_matches('/').to_string(),
            access_token: lookup("BUCKET_ACCESS_TOKEN"),
        });

        Ok(Self {
            work_dir: lookup("KONTEXT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("kontext-jobs")),
            model,
            inference_url,
            request_timeout_s: parse_seconds(lookup("KONTEXT_REQUEST_TIMEOUT"), 300.0, 5.0, 3600.0),
            bucket,
            events_path: lookup("KONTEXT_EVENTS_PATH").map(PathBuf::from),
        })
    }
}

/// Settings for the one-time weight download.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionConfig {
    pub model_id: String,
    pub hub_base: String,
    pub cache_dir: PathBuf,
    pub hf_token: Option<String>,
    pub max_attempts: usize,
    pub retry_backoff_s: f64,
}

impl ProvisionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            model_id: lookup("KONTEXT_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            hub_base: lookup("KONTEXT_HUB_BASE")
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_HUB_BASE.to_string()),
            cache_dir: lookup("KONTEXT_WEIGHTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("weights")),
            hf_token: lookup("HF_TOKEN"),
            max_attempts: PROVISION_MAX_ATTEMPTS,
            retry_backoff_s: 2.0,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_seconds(raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    raw.and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}
