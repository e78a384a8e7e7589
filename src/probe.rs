//! Input validation ahead of the encoder.
//!
//! Obviously hopeless inputs (missing file, zero bytes, container ffprobe
//! cannot read) are rejected here so the pipeline never pays for an
//! encoder spawn it knows will fail.

use std::io;
use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::error::JobError;

/// Seam for the ffprobe invocation so validation logic is testable
/// without the binary installed.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ProbeRunner: Send + Sync {
    async fn run_ffprobe_for_duration(&self, media_path: &Path) -> io::Result<Output>;
}

pub struct FfprobeRunner {
    bin: String,
}

impl FfprobeRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Startup health probe, the counterpart of
    /// [`crate::transcode::FfmpegExecutor::verify`].
    pub async fn verify(bin: &str) -> Result<(), JobError> {
        let output = Command::new(bin)
            .arg("-version")
            .output()
            .await
            .map_err(JobError::ProcessLaunch)?;

        if !output.status.success() {
            return Err(JobError::ProcessLaunch(io::Error::new(
                io::ErrorKind::Other,
                format!("{} -version exited with {}", bin, output.status),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProbeRunner for FfprobeRunner {
    async fn run_ffprobe_for_duration(&self, media_path: &Path) -> io::Result<Output> {
        Command::new(&self.bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(media_path)
            .output()
            .await
    }
}

/// Check that `path` holds plausibly transcodable media and return its
/// container duration in seconds.
pub async fn validate_input(path: &Path, runner: &impl ProbeRunner) -> Result<f64, JobError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| JobError::Validation(format!("input file missing: {}", path.display())))?;

    if meta.len() == 0 {
        return Err(JobError::Validation(format!(
            "input file is empty: {}",
            path.display()
        )));
    }

    let output = runner
        .run_ffprobe_for_duration(path)
        .await
        .map_err(JobError::ProcessLaunch)?;

    if !output.status.success() {
        return Err(JobError::Validation(format!(
            "unreadable media container: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let re = Regex::new(r"(\d+(?:\.\d+)?)").unwrap();

    re.captures(&stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| {
            JobError::Validation(format!(
                "media container reports no duration: {}",
                path.display()
            ))
        })
}
