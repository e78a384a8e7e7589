//! On-disk layout for HLS job output.
//!
//! Each job encodes into a private staging directory `{root}/{job_id}.part`
//! and is renamed to `{root}/{job_id}` only after the encoder has exited
//! successfully and the manifest has been verified. A partially written
//! manifest is therefore never reachable through a public locator.

use std::io;
use std::path::PathBuf;

use crate::error::JobError;

/// Manifest file name inside a job's output directory.
pub const MANIFEST_NAME: &str = "index.m3u8";

/// Segment file name pattern handed to the encoder. The zero-padded index
/// keeps lexical order equal to playback order.
pub const SEGMENT_PATTERN: &str = "segment_%03d.ts";

const STAGING_SUFFIX: &str = ".part";

/// Paths prepared for one job, all rooted under the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub work_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_pattern: PathBuf,
}

/// Computes and creates the per-job output layout under a fixed root.
#[derive(Debug, Clone)]
pub struct HlsLayout {
    root: PathBuf,
}

/// Job ids are opaque tokens of `[A-Za-z0-9-]`. Anything else (notably a
/// `.part` suffix or path separators) must never reach the filesystem.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl HlsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory a completed job is served from.
    pub fn published_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{}{}", job_id, STAGING_SUFFIX))
    }

    /// Create the staging directory for a job and return its paths.
    ///
    /// Idempotent for a given `job_id` as long as nothing has been
    /// published yet; refuses to proceed if a non-empty manifest already
    /// exists under the published directory, so a completed asset is never
    /// silently overwritten.
    pub async fn prepare(&self, job_id: &str) -> Result<JobPaths, JobError> {
        if !is_valid_job_id(job_id) {
            return Err(JobError::Validation(format!(
                "malformed job id: {:?}",
                job_id
            )));
        }

        let published_manifest = self.published_dir(job_id).join(MANIFEST_NAME);
        if let Ok(meta) = tokio::fs::metadata(&published_manifest).await {
            if meta.len() > 0 {
                return Err(JobError::Storage(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("job {} already has a published manifest", job_id),
                )));
            }
        }

        let work_dir = self.staging_dir(job_id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(JobError::Storage)?;

        Ok(JobPaths {
            manifest_path: work_dir.join(MANIFEST_NAME),
            segment_pattern: work_dir.join(SEGMENT_PATTERN),
            work_dir,
        })
    }

    /// Atomically move a finished job's staging directory into place and
    /// return the published directory.
    pub async fn publish(&self, job_id: &str) -> Result<PathBuf, JobError> {
        let published = self.published_dir(job_id);
        tokio::fs::rename(self.staging_dir(job_id), &published)
            .await
            .map_err(JobError::Storage)?;
        Ok(published)
    }

    /// Best-effort removal of a failed job's staging directory.
    pub async fn discard(&self, job_id: &str) {
        let _ = tokio::fs::remove_dir_all(self.staging_dir(job_id)).await;
    }

    /// Public locator for a published job. Only meaningful after
    /// [`HlsLayout::publish`] has succeeded.
    pub fn locator(&self, job_id: &str) -> String {
        format!("/hls/{}/{}", job_id, MANIFEST_NAME)
    }
}
