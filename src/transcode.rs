//! Invocation and supervision of the external encoder process.
//!
//! One encoder process per call. Its stderr is drained continuously on a
//! separate task so a chatty encoder can never block on a full pipe while
//! the controller awaits it, and the captured diagnostic tail is bounded.
//! A non-zero exit is a normal [`TerminalOutcome`], not an error; only a
//! failed spawn surfaces as [`JobError::ProcessLaunch`].

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::JobError;

/// Upper bound on the captured diagnostic tail, in bytes.
pub const DIAGNOSTIC_LIMIT: usize = 16 * 1024;

/// Encoder parameters for one VOD HLS rendition.
#[derive(Debug, Clone)]
pub struct TranscodeOptions {
    /// Target segment duration; shorter segments seek faster but grow the manifest.
    pub segment_duration_secs: u32,
    pub video_codec: String,
    pub audio_codec: String,
    /// Compatibility baseline for the video encode.
    pub video_profile: String,
    /// Quality/size tradeoff, lower is better quality.
    pub constant_rate_factor: u32,
    pub audio_bitrate: String,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            segment_duration_secs: 6,
            video_codec: String::from("h264"),
            audio_codec: String::from("aac"),
            video_profile: String::from("main"),
            constant_rate_factor: 20,
            audio_bitrate: String::from("128k"),
        }
    }
}

/// How the encoder process reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Killed on timeout or by a signal before exiting.
    Terminated,
}

/// Final result of one encoder invocation.
#[derive(Debug, Clone)]
pub struct TerminalOutcome {
    pub status: ExitKind,
    /// Bounded tail of the encoder's stderr.
    pub diagnostic: String,
}

impl TerminalOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, ExitKind::Exited(0))
    }
}

/// Seam for the encoder invocation, mirroring the ffprobe seam in
/// [`crate::probe`].
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait TranscodeExecutor: Send + Sync {
    async fn transcode(
        &self,
        input: &Path,
        manifest_path: &Path,
        segment_pattern: &Path,
        options: &TranscodeOptions,
    ) -> Result<TerminalOutcome, JobError>;
}

/// Drives a real ffmpeg binary.
pub struct FfmpegExecutor {
    bin: String,
    timeout: Option<Duration>,
}

impl FfmpegExecutor {
    /// `timeout_secs` of 0 disables the wall-clock limit.
    pub fn new(bin: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            bin: bin.into(),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    /// Startup health probe. A missing or unexecutable encoder binary is a
    /// configuration error that should fail the service at boot, not on
    /// the first upload.
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

/// Argument vector for one VOD HLS encode.
fn build_args(
    input: &Path,
    manifest_path: &Path,
    segment_pattern: &Path,
    options: &TranscodeOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    args.push("-nostdin".into());
    args.push("-y".into());
    args.push("-i".into());
    args.push(input.into());
    args.push("-c:v".into());
    args.push(options.video_codec.as_str().into());
    args.push("-profile:v".into());
    args.push(options.video_profile.as_str().into());
    args.push("-crf".into());
    args.push(options.constant_rate_factor.to_string().into());
    args.push("-c:a".into());
    args.push(options.audio_codec.as_str().into());
    args.push("-b:a".into());
    args.push(options.audio_bitrate.as_str().into());
    args.push("-hls_time".into());
    args.push(options.segment_duration_secs.to_string().into());
    args.push("-hls_playlist_type".into());
    args.push("vod".into());
    args.push("-hls_segment_filename".into());
    args.push(segment_pattern.into());
    args.push(manifest_path.into());
    args
}

#[async_trait]
impl TranscodeExecutor for FfmpegExecutor {
    async fn transcode(
        &self,
        input: &Path,
        manifest_path: &Path,
        segment_pattern: &Path,
        options: &TranscodeOptions,
    ) -> Result<TerminalOutcome, JobError> {
        let args = build_args(input, manifest_path, segment_pattern, options);
        debug!(bin = %self.bin, input = %input.display(), "spawning encoder");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(JobError::ProcessLaunch)?;

        let stderr = child.stderr.take().ok_or_else(|| {
            JobError::ProcessLaunch(io::Error::new(
                io::ErrorKind::Other,
                "failed to capture encoder stderr",
            ))
        })?;

        // Drain stderr concurrently, keeping only a bounded tail. The
        // child must never be left blocking on a full pipe.
        let drain = tokio::spawn(async move {
            let mut kept: VecDeque<String> = VecDeque::new();
            let mut kept_bytes = 0usize;
            let mut lines = BufReader::new(stderr).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "encoder", "{}", line);
                kept_bytes += line.len() + 1;
                kept.push_back(line);
                while kept_bytes > DIAGNOSTIC_LIMIT {
                    match kept.pop_front() {
                        Some(dropped) => kept_bytes -= dropped.len() + 1,
                        None => break,
                    }
                }
            }

            let mut tail = String::with_capacity(kept_bytes);
            for line in kept {
                tail.push_str(&line);
                tail.push('\n');
            }
            tail
        });

        let status = match self.timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(exit) => exit.map_err(JobError::ProcessLaunch)?,
                    Err(_) => {
                        warn!(
                            limit_secs = limit.as_secs(),
                            "encoder exceeded wall-clock limit, killing"
                        );
                        let _ = child.kill().await;
                        let tail = drain.await.unwrap_or_default();
                        return Ok(TerminalOutcome {
                            status: ExitKind::Terminated,
                            diagnostic: format!(
                                "terminated: encoder exceeded {}s timeout\n{}",
                                limit.as_secs(),
                                tail
                            ),
                        });
                    }
                }
            }
            None => child.wait().await.map_err(JobError::ProcessLaunch)?,
        };

        let diagnostic = drain.await.unwrap_or_default();
        let status = match status.code() {
            Some(code) => ExitKind::Exited(code),
            // No exit code means a signal took the process down.
            None => ExitKind::Terminated,
        };

        Ok(TerminalOutcome { status, diagnostic })
    }
}
