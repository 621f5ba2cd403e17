use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ErrorDetail, JobResponse};

/// Lifecycle of one job. Every job ends in `Responded`, passing through
/// `Error` when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Validated,
    GeometryResolved,
    Seeded,
    Generated,
    Materialized,
    Responded,
    Error,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::GeometryResolved => "geometry_resolved",
            Self::Seeded => "seeded",
            Self::Generated => "generated",
            Self::Materialized => "materialized",
            Self::Responded => "responded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transition learned, when it learned something.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateDetail {
    Geometry {
        aspect_ratio: String,
        source: String,
        width: u32,
        height: u32,
    },
    Seed {
        seed: u64,
        synthesized: bool,
    },
    Failure {
        error: ErrorDetail,
        refresh_worker: bool,
    },
    Output {
        uploaded: bool,
    },
}

impl StateDetail {
    /// `None` for a success envelope.
    pub fn failure(response: &JobResponse) -> Option<Self> {
        match response {
            JobResponse::Failure {
                error,
                refresh_worker,
            } => Some(Self::Failure {
                error: error.clone(),
                refresh_worker: *refresh_worker,
            }),
            JobResponse::Success { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub ts: String,
    pub worker_id: String,
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<StateDetail>,
}

/// JSON-lines log of job state transitions, shared by every job of one
/// worker process.
#[derive(Debug)]
pub struct JobEventLog {
    path: PathBuf,
    worker_id: String,
    lock: Mutex<()>,
}

impl JobEventLog {
    pub fn new(path: impl Into<PathBuf>, worker_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            worker_id: worker_id.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn record(
        &self,
        job_id: &str,
        state: JobState,
        detail: Option<StateDetail>,
    ) -> Result<JobEvent> {
        let event = JobEvent {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            worker_id: self.worker_id.clone(),
            job_id: job_id.to_string(),
            state,
            detail,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("job event log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(event)
    }
}
