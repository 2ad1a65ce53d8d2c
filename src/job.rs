// Conversion of a single file as a state machine.
//
// ```text
// Pending ──► Running ──► Completed
//    │           └──────► Failed
//    ├──────────────────► Skipped   (resume: output already present)
//    └──────────────────► Failed    (cancelled before launch)
// ```
//
// `ConversionJob::run` consumes the job, so every task yields exactly one
// `JobResult`.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{EncoderConfig, Preset};
use crate::encoder::{Encoder, ProgressEvent, TerminalStatus};
use crate::error::{ConvertError, Result};
use crate::inventory::InputFile;

/// Parameters handed to the encoder for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodeParams {
    pub preset: Preset,
    pub crf: u8,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub scale: Option<String>,
    pub extra_options: Vec<String>,
}

impl EncodeParams {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            preset: config.preset,
            crf: config.crf,
            video_codec: config.video_codec.clone(),
            audio_codec: config.audio_codec.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
            scale: config.scale.clone(),
            extra_options: config.extra_options.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionTask {
    /// Position of the task in its batch
    pub id: usize,
    pub input: InputFile,
    pub output_path: PathBuf,
    pub params: EncodeParams,
}

impl ConversionTask {
    pub fn new(
        id: usize,
        input: InputFile,
        output_dir: &Path,
        output_extension: &str,
        params: EncodeParams,
    ) -> Self {
        let output_path = output_path_for(&input.path, output_dir, output_extension);
        Self {
            id,
            input,
            output_path,
            params,
        }
    }
}

/// `<output_dir>/<input stem>.<extension>`; the same input always maps to
/// the same output, which is what resuming relies on.
pub fn output_path_for(input: &Path, output_dir: &Path, extension: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    output_dir.join(format!("{}.{}", stem, extension.trim_start_matches('.')))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Skipped)
    }

    fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Skipped)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The encoder exited unsuccessfully
    Encoder {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    /// Stopped by the user; `started` tells whether an encoder ran
    Cancelled { started: bool },
    /// The encoder reported success but left no output file
    MissingOutput,
    /// The job task itself broke down
    Internal(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Encoder {
                exit_code: Some(code),
                diagnostic,
            } => write!(f, "encoder exited with code {}: {}", code, diagnostic),
            FailureReason::Encoder {
                exit_code: None,
                diagnostic,
            } => write!(f, "encoder failed: {}", diagnostic),
            FailureReason::Cancelled { started: true } => f.write_str("cancelled while encoding"),
            FailureReason::Cancelled { started: false } => f.write_str("cancelled before start"),
            FailureReason::MissingOutput => f.write_str("encoder produced no output file"),
            FailureReason::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Completed,
    Failed(FailureReason),
    Skipped,
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
            JobOutcome::Skipped => JobState::Skipped,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Failed(FailureReason::Cancelled { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub task: ConversionTask,
    pub outcome: JobOutcome,
    pub input_size: u64,
    /// Zero unless the job completed
    pub output_size: u64,
    pub duration: Duration,
}

impl JobResult {
    pub fn failed(task: ConversionTask, reason: FailureReason, duration: Duration) -> Self {
        Self {
            input_size: task.input.size,
            task,
            outcome: JobOutcome::Failed(reason),
            output_size: 0,
            duration,
        }
    }

    /// Output size relative to input size, in percent.
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.outcome == JobOutcome::Completed && self.input_size > 0)
            .then(|| self.output_size as f64 / self.input_size as f64 * 100.0)
    }
}

/// Batch-level policy applied to every job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobPolicy {
    pub resume: bool,
    pub delete_originals: bool,
    pub remove_partial_output: bool,
}

pub struct ConversionJob {
    task: ConversionTask,
    state: JobState,
}

impl ConversionJob {
    pub fn new(task: ConversionTask) -> Self {
        Self {
            task,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn task(&self) -> &ConversionTask {
        &self.task
    }

    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ConvertError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Job {} {:?} -> {:?}", self.task.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Drive the job to a terminal state and report it.
    pub async fn run(
        mut self,
        encoder: Arc<dyn Encoder>,
        policy: JobPolicy,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancelToken,
    ) -> JobResult {
        let started = Instant::now();

        if policy.resume {
            if let Some(size) = existing_output_size(&self.task.output_path).await {
                info!(
                    "Skipping {}: {} already exists ({} bytes)",
                    self.task.input.path.display(),
                    self.task.output_path.display(),
                    size
                );
                return self.finish(JobOutcome::Skipped, 0, started.elapsed());
            }
        }

        if cancel.is_cancelled() {
            return self.finish(
                JobOutcome::Failed(FailureReason::Cancelled { started: false }),
                0,
                started.elapsed(),
            );
        }

        self.enter(JobState::Running);
        info!(
            "Converting {} -> {}",
            self.task.input.path.display(),
            self.task.output_path.display()
        );

        let status = encoder.encode(&self.task, progress, cancel).await;
        let elapsed = started.elapsed();

        match status {
            TerminalStatus::Success => match tokio::fs::metadata(&self.task.output_path).await {
                Ok(meta) => {
                    let output_size = meta.len();
                    if policy.delete_originals {
                        self.delete_original().await;
                    }
                    self.finish(JobOutcome::Completed, output_size, elapsed)
                }
                Err(e) => {
                    warn!(
                        "Encoder succeeded but {} is unreadable: {}",
                        self.task.output_path.display(),
                        e
                    );
                    self.finish(JobOutcome::Failed(FailureReason::MissingOutput), 0, elapsed)
                }
            },
            TerminalStatus::Failure {
                exit_code,
                diagnostic,
            } => {
                warn!(
                    "Conversion of {} failed (exit code {:?})",
                    self.task.input.path.display(),
                    exit_code
                );
                self.handle_partial_output(policy).await;
                self.finish(
                    JobOutcome::Failed(FailureReason::Encoder {
                        exit_code,
                        diagnostic,
                    }),
                    0,
                    elapsed,
                )
            }
            TerminalStatus::Cancelled => {
                self.handle_partial_output(policy).await;
                self.finish(
                    JobOutcome::Failed(FailureReason::Cancelled { started: true }),
                    0,
                    elapsed,
                )
            }
        }
    }

    /// Transition that the run loop guarantees to be valid.
    fn enter(&mut self, next: JobState) {
        if let Err(e) = self.transition(next) {
            warn!("{}", e);
            self.state = next;
        }
    }

    fn finish(mut self, outcome: JobOutcome, output_size: u64, duration: Duration) -> JobResult {
        self.enter(outcome.state());
        JobResult {
            input_size: self.task.input.size,
            task: self.task,
            outcome,
            output_size,
            duration,
        }
    }

    async fn handle_partial_output(&self, policy: JobPolicy) {
        let path = &self.task.output_path;
        if !policy.remove_partial_output {
            if path.exists() {
                debug!("Leaving partial output in place: {}", path.display());
            }
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Removed partial output {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
        }
    }

    async fn delete_original(&self) {
        let path = &self.task.input.path;
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Deleted original {}", path.display()),
            Err(e) => warn!("Failed to delete original {}: {}", path.display(), e),
        }
    }
}

async fn existing_output_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|meta| meta.is_file() && meta.len() > 0)
        .map(|meta| meta.len())
}
