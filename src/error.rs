//! Error types for the transcoding pipeline.
//!
//! A non-zero encoder exit is deliberately NOT represented here; it is a
//! normal terminal outcome carried in [`crate::transcode::TerminalOutcome`]
//! and reported through the job result, never as an `Err`.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum JobError {
    /// Input cannot possibly transcode (missing, empty, unreadable container).
    Validation(String),
    /// Output layout could not be created or moved into place.
    Storage(io::Error),
    /// The external tool binary could not be spawned at all.
    ProcessLaunch(io::Error),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Validation(msg) => write!(f, "invalid input: {}", msg),
            JobError::Storage(e) => write!(f, "storage error: {}", e),
            JobError::ProcessLaunch(e) => write!(f, "failed to launch external tool: {}", e),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Validation(_) => None,
            JobError::Storage(e) => Some(e),
            JobError::ProcessLaunch(e) => Some(e),
        }
    }
}
