use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const ID_DIGEST_LEN: usize = 16;

/// Job-scoped scratch directory. It is removed by [`JobWorkspace::remove`],
/// or on drop when a job ends early.
#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
    removed: bool,
}

impl JobWorkspace {
    pub fn create(root: &Path, job_id: &str) -> Result<Self> {
        let path = root.join(sanitize_job_id(job_id));
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create job directory {}", path.display()))?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }

    pub fn remove(mut self) -> Result<()> {
        self.removed = true;
        remove_dir(&self.path)
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(err) = remove_dir(&self.path) {
            tracing::warn!("job directory cleanup failed: {err:#}");
        }
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove job directory {}", path.display()))
        }
    }
}

/// Maps a job id onto a single safe path component.
///
/// Ids already made of `[A-Za-z0-9_-]` are kept as they are. Any other id
/// gets a digest of the raw id appended, so two ids that clean up to the
/// same text still land in different directories and upload keys.
pub fn sanitize_job_id(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !cleaned.is_empty() && cleaned == job_id {
        return cleaned;
    }
    let digest = hex::encode(Sha256::digest(job_id.as_bytes()));
    let stem = if cleaned.is_empty() { "job" } else { &cleaned };
    format!("{stem}-{}", &digest[..ID_DIGEST_LEN])
}
