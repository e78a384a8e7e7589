//! End-to-end orchestration of one transcoding job.
//!
//! `Created → Preparing → Running → Succeeded | Failed`, exactly one
//! encode attempt per job. Every per-job error is absorbed here and
//! reported through [`SubmitOutcome`]; nothing escapes into the HTTP
//! handler. The semaphore bounds how many jobs run external processes at
//! once, probe and encoder alike, and each job only ever awaits its own
//! child.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::layout::{HlsLayout, JobPaths};
use crate::manifest;
use crate::probe::{validate_input, ProbeRunner};
use crate::transcode::{ExitKind, TranscodeExecutor, TranscodeOptions};

/// Where a job stands in its single transcode attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Preparing,
    Running,
    Succeeded,
    Failed,
}

/// Classifies a failed job for the caller's status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The input was rejected before the encoder ran.
    InvalidInput,
    /// Storage or launch prerequisites broke on our side.
    Internal,
    /// The encoder exited non-zero or was terminated.
    Transcode,
}

/// Result descriptor for one submitted job.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Succeeded {
        job_id: String,
        locator: String,
    },
    Failed {
        job_id: String,
        kind: FailureKind,
        diagnostic: String,
    },
}

struct Failure {
    kind: FailureKind,
    diagnostic: String,
}

impl From<JobError> for Failure {
    fn from(err: JobError) -> Self {
        let kind = match err {
            JobError::Validation(_) => FailureKind::InvalidInput,
            JobError::Storage(_) | JobError::ProcessLaunch(_) => FailureKind::Internal,
        };
        Failure {
            kind,
            diagnostic: err.to_string(),
        }
    }
}

pub struct JobController<E, P> {
    layout: HlsLayout,
    executor: E,
    probe: P,
    semaphore: Arc<Semaphore>,
    options: TranscodeOptions,
    cleanup_failed_output: bool,
    keep_source: bool,
}

impl<E, P> JobController<E, P>
where
    E: TranscodeExecutor,
    P: ProbeRunner,
{
    pub fn new(
        layout: HlsLayout,
        executor: E,
        probe: P,
        max_concurrent_jobs: usize,
        options: TranscodeOptions,
        cleanup_failed_output: bool,
        keep_source: bool,
    ) -> Self {
        Self {
            layout,
            executor,
            probe,
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            options,
            cleanup_failed_output,
            keep_source,
        }
    }

    /// Run one transcoding job to its terminal state.
    pub async fn submit(&self, input: &Path) -> SubmitOutcome {
        let job_id = Uuid::new_v4().to_string();
        info!(
            job_id = %job_id,
            input = %input.display(),
            state = ?JobState::Created,
            "job accepted"
        );

        let result = self.run_job(&job_id, input).await;

        if !self.keep_source {
            let _ = tokio::fs::remove_file(input).await;
        }

        match result {
            Ok(locator) => {
                info!(job_id = %job_id, locator = %locator, "job succeeded");
                SubmitOutcome::Succeeded { job_id, locator }
            }
            Err(failure) => {
                warn!(
                    job_id = %job_id,
                    kind = ?failure.kind,
                    "job failed: {}",
                    failure.diagnostic.lines().next().unwrap_or("")
                );
                SubmitOutcome::Failed {
                    job_id,
                    kind: failure.kind,
                    diagnostic: failure.diagnostic,
                }
            }
        }
    }

    async fn run_job(&self, job_id: &str, input: &Path) -> Result<String, Failure> {
        // Admission control: the permit covers every external process the
        // job spawns, probe included; excess submissions queue here on
        // their own flow.
        let _permit = self.semaphore.acquire().await.map_err(|_| Failure {
            kind: FailureKind::Internal,
            diagnostic: String::from("job admission queue is closed"),
        })?;

        debug!(job_id = %job_id, state = ?JobState::Preparing, "validating input");
        let duration = validate_input(input, &self.probe)
            .await
            .map_err(Failure::from)?;
        debug!(job_id = %job_id, duration_secs = duration, "input validated");
        let paths = self.layout.prepare(job_id).await.map_err(Failure::from)?;

        debug!(job_id = %job_id, state = ?JobState::Running, "starting encode");
        let result = self.run_encode(job_id, input, &paths).await;

        if result.is_err() && self.cleanup_failed_output {
            self.layout.discard(job_id).await;
        }

        let state = if result.is_ok() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        info!(job_id = %job_id, state = ?state, "job reached terminal state");

        result
    }

    async fn run_encode(
        &self,
        job_id: &str,
        input: &Path,
        paths: &JobPaths,
    ) -> Result<String, Failure> {
        let outcome = self
            .executor
            .transcode(input, &paths.manifest_path, &paths.segment_pattern, &self.options)
            .await
            .map_err(Failure::from)?;

        if !outcome.success() {
            let diagnostic = match outcome.status {
                ExitKind::Terminated => outcome.diagnostic,
                ExitKind::Exited(code) => {
                    format!("encoder exited with status {}\n{}", code, outcome.diagnostic)
                }
            };
            return Err(Failure {
                kind: FailureKind::Transcode,
                diagnostic,
            });
        }

        let segments = manifest::verify(&paths.manifest_path, &paths.work_dir)
            .await
            .map_err(|diagnostic| Failure {
                kind: FailureKind::Transcode,
                diagnostic,
            })?;
        info!(job_id = %job_id, segments = segments.len(), "manifest verified");

        self.layout.publish(job_id).await.map_err(Failure::from)?;
        Ok(self.layout.locator(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockProbeRunner;
    use crate::transcode::{MockTranscodeExecutor, TerminalOutcome};
    use std::collections::HashSet;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::{ExitStatus, Output};
    use tempfile::{tempdir, TempDir};

    fn readable_probe() -> MockProbeRunner {
        let mut probe = MockProbeRunner::new();
        probe.expect_run_ffprobe_for_duration().returning(|_| {
            Box::pin(async move {
                Ok(Output {
                    status: ExitStatus::from_raw(0),
                    stdout: b"10.0\n".to_vec(),
                    stderr: Vec::new(),
                })
            })
        });
        probe
    }

    fn encoder_writing_asset(times: usize) -> MockTranscodeExecutor {
        let mut executor = MockTranscodeExecutor::new();
        executor
            .expect_transcode()
            .times(times)
            .returning(|_, manifest_path, segment_pattern, _| {
                let work_dir = segment_pattern.parent().unwrap();
                std::fs::write(
                    manifest_path,
                    "#EXTM3U\n#EXTINF:6.0,\nsegment_000.ts\n#EXTINF:4.0,\nsegment_001.ts\n#EXT-X-ENDLIST\n",
                )
                .unwrap();
                std::fs::write(work_dir.join("segment_000.ts"), b"ts").unwrap();
                std::fs::write(work_dir.join("segment_001.ts"), b"ts").unwrap();
                Box::pin(async move {
                    Ok(TerminalOutcome {
                        status: ExitKind::Exited(0),
                        diagnostic: String::new(),
                    })
                })
            });
        executor
    }

    fn staged_input(dir: &TempDir) -> PathBuf {
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"mp4 bytes").unwrap();
        input
    }

    fn controller<E: TranscodeExecutor, P: ProbeRunner>(
        root: &Path,
        executor: E,
        probe: P,
    ) -> JobController<E, P> {
        JobController::new(
            HlsLayout::new(root),
            executor,
            probe,
            4,
            TranscodeOptions::default(),
            true,
            true,
        )
    }

    #[tokio::test]
    async fn test_successful_job_publishes_and_yields_locator() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);
        let hls_root = dir.path().join("hls");

        let controller = controller(&hls_root, encoder_writing_asset(1), readable_probe());
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Succeeded { job_id, locator } = outcome else {
            panic!("expected success");
        };
        assert_eq!(locator, format!("/hls/{}/index.m3u8", job_id));
        assert!(hls_root.join(&job_id).join("index.m3u8").is_file());
        assert!(hls_root.join(&job_id).join("segment_001.ts").is_file());
        // staging dir is gone after publish
        assert!(!hls_root.join(format!("{}.part", job_id)).exists());
        // source retained by default
        assert!(input.is_file());
    }

    #[tokio::test]
    async fn test_empty_input_fails_without_spawning_encoder() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("empty.mp4");
        std::fs::write(&input, b"").unwrap();

        let mut executor = MockTranscodeExecutor::new();
        executor.expect_transcode().times(0);
        let mut probe = MockProbeRunner::new();
        probe.expect_run_ffprobe_for_duration().times(0);

        let controller = controller(&dir.path().join("hls"), executor, probe);
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Failed { kind, diagnostic, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::InvalidInput);
        assert!(diagnostic.contains("empty"));
    }

    #[tokio::test]
    async fn test_encoder_rejection_fails_with_diagnostic_and_no_asset() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);
        let hls_root = dir.path().join("hls");

        let mut executor = MockTranscodeExecutor::new();
        executor.expect_transcode().times(1).returning(|_, _, _, _| {
            Box::pin(async move {
                Ok(TerminalOutcome {
                    status: ExitKind::Exited(1),
                    diagnostic: String::from("moov atom not found"),
                })
            })
        });

        let controller = controller(&hls_root, executor, readable_probe());
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Failed { job_id, kind, diagnostic } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Transcode);
        assert!(diagnostic.contains("moov atom not found"));
        assert!(diagnostic.contains("exited with status 1"));
        // neither published nor staging output remains
        assert!(!hls_root.join(&job_id).exists());
        assert!(!hls_root.join(format!("{}.part", job_id)).exists());
    }

    #[tokio::test]
    async fn test_terminated_encoder_reports_terminated_marker() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);

        let mut executor = MockTranscodeExecutor::new();
        executor.expect_transcode().times(1).returning(|_, _, _, _| {
            Box::pin(async move {
                Ok(TerminalOutcome {
                    status: ExitKind::Terminated,
                    diagnostic: String::from("terminated: encoder exceeded 30s timeout"),
                })
            })
        });

        let controller = controller(&dir.path().join("hls"), executor, readable_probe());
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Failed { kind, diagnostic, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Transcode);
        assert!(diagnostic.contains("terminated"));
    }

    #[tokio::test]
    async fn test_manifest_referencing_missing_segment_fails_job() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);
        let hls_root = dir.path().join("hls");

        let mut executor = MockTranscodeExecutor::new();
        executor
            .expect_transcode()
            .times(1)
            .returning(|_, manifest_path, _, _| {
                // claims a segment it never wrote
                std::fs::write(manifest_path, "#EXTM3U\nsegment_000.ts\n").unwrap();
                Box::pin(async move {
                    Ok(TerminalOutcome {
                        status: ExitKind::Exited(0),
                        diagnostic: String::new(),
                    })
                })
            });

        let controller = controller(&hls_root, executor, readable_probe());
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Failed { job_id, kind, diagnostic } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Transcode);
        assert!(diagnostic.contains("segment_000.ts"));
        assert!(!hls_root.join(&job_id).exists());
    }

    #[tokio::test]
    async fn test_launch_error_is_internal() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);

        let mut executor = MockTranscodeExecutor::new();
        executor.expect_transcode().times(1).returning(|_, _, _, _| {
            Box::pin(async move {
                Err(JobError::ProcessLaunch(io::Error::new(
                    io::ErrorKind::NotFound,
                    "ffmpeg not found",
                )))
            })
        });

        let controller = controller(&dir.path().join("hls"), executor, readable_probe());
        let outcome = controller.submit(&input).await;

        let SubmitOutcome::Failed { kind, .. } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(kind, FailureKind::Internal);
    }

    #[tokio::test]
    async fn test_source_removed_when_retention_disabled() {
        let dir = tempdir().unwrap();
        let input = staged_input(&dir);

        let controller = JobController::new(
            HlsLayout::new(dir.path().join("hls")),
            encoder_writing_asset(1),
            readable_probe(),
            4,
            TranscodeOptions::default(),
            true,
            false,
        );
        let outcome = controller.submit(&input).await;

        assert!(matches!(outcome, SubmitOutcome::Succeeded { .. }));
        assert!(!input.exists());
    }

    #[tokio::test]
    async fn test_admission_bound_covers_probe_and_encoder() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        const N: usize = 4;

        let dir = tempdir().unwrap();
        let input = staged_input(&dir);
        let hls_root = dir.path().join("hls");

        // external processes in flight right now, and the highest seen
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let enter = {
            let active = active.clone();
            let peak = peak.clone();
            move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            }
        };
        let exit = {
            let active = active.clone();
            move || {
                active.fetch_sub(1, Ordering::SeqCst);
            }
        };

        let mut probe = MockProbeRunner::new();
        {
            let enter = enter.clone();
            let exit = exit.clone();
            probe
                .expect_run_ffprobe_for_duration()
                .times(N)
                .returning(move |_| {
                    let enter = enter.clone();
                    let exit = exit.clone();
                    Box::pin(async move {
                        enter();
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        exit();
                        Ok(Output {
                            status: ExitStatus::from_raw(0),
                            stdout: b"10.0\n".to_vec(),
                            stderr: Vec::new(),
                        })
                    })
                });
        }

        let mut executor = MockTranscodeExecutor::new();
        executor
            .expect_transcode()
            .times(N)
            .returning(move |_, manifest_path, segment_pattern, _| {
                let work_dir = segment_pattern.parent().unwrap();
                std::fs::write(manifest_path, "#EXTM3U\nsegment_000.ts\n").unwrap();
                std::fs::write(work_dir.join("segment_000.ts"), b"ts").unwrap();
                let enter = enter.clone();
                let exit = exit.clone();
                Box::pin(async move {
                    enter();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    exit();
                    Ok(TerminalOutcome {
                        status: ExitKind::Exited(0),
                        diagnostic: String::new(),
                    })
                })
            });

        let controller = JobController::new(
            HlsLayout::new(&hls_root),
            executor,
            probe,
            1,
            TranscodeOptions::default(),
            true,
            true,
        );

        let outcomes =
            futures::future::join_all((0..N).map(|_| controller.submit(&input))).await;
        for outcome in outcomes {
            assert!(matches!(outcome, SubmitOutcome::Succeeded { .. }));
        }
        // one permit covers a job's probe and its encoder alike
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_distinct_locators() {
        const N: usize = 8;

        let dir = tempdir().unwrap();
        let input = staged_input(&dir);
        let hls_root = dir.path().join("hls");

        let controller = controller(&hls_root, encoder_writing_asset(N), readable_probe());

        let outcomes =
            futures::future::join_all((0..N).map(|_| controller.submit(&input))).await;

        let mut locators = HashSet::new();
        for outcome in outcomes {
            let SubmitOutcome::Succeeded { locator, .. } = outcome else {
                panic!("expected success");
            };
            locators.insert(locator);
        }
        assert_eq!(locators.len(), N);
    }
}
