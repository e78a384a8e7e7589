//! Service configuration, loaded once at startup.
//!
//! Every path the pipeline touches is carried here explicitly; nothing
//! reads ambient globals after `from_env` returns.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: String,
    /// Staging directory for uploaded originals
    pub upload_dir: PathBuf,
    /// Root directory for published HLS assets
    pub hls_root: PathBuf,
    /// ffmpeg binary (name or absolute path)
    pub ffmpeg_bin: String,
    /// ffprobe binary (name or absolute path)
    pub ffprobe_bin: String,
    /// Upper bound on concurrently running encoder processes
    pub max_concurrent_jobs: usize,
    /// Per-job wall-clock limit in seconds, 0 disables the limit
    pub job_timeout_secs: u64,
    /// Remove a failed job's partial output directory
    pub cleanup_failed_output: bool,
    /// Retain the staged original after the job finishes
    pub keep_source: bool,
    /// Request body ceiling for uploads, in bytes
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            addr: env::var("ADDR").unwrap_or_else(|_| String::from("127.0.0.1")),
            port: env::var("PORT").unwrap_or_else(|_| String::from("3000")),
            upload_dir: env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| String::from("uploads/originals"))
                .into(),
            hls_root: env::var("HLS_ROOT")
                .unwrap_or_else(|_| String::from("uploads/hls"))
                .into(),
            ffmpeg_bin: env::var("FFMPEG_BIN").unwrap_or_else(|_| String::from("ffmpeg")),
            ffprobe_bin: env::var("FFPROBE_BIN").unwrap_or_else(|_| String::from("ffprobe")),
            max_concurrent_jobs: parsed_or("MAX_CONCURRENT_JOBS", 4),
            job_timeout_secs: parsed_or("JOB_TIMEOUT_SECS", 0),
            cleanup_failed_output: parsed_or("CLEANUP_FAILED_OUTPUT", true),
            keep_source: parsed_or("KEEP_SOURCE", true),
            max_upload_bytes: parsed_or("MAX_UPLOAD_BYTES", 500 * 1024 * 1024),
        }
    }
}

fn parsed_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
