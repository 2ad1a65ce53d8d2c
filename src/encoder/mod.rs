// Encoder backends
//
// The scheduler and the job state machine only see the `Encoder` trait:
// - commands: argument template for the ffmpeg invocation
// - progress: incremental parser for the `-progress` status channel
// - ffmpeg: subprocess supervision for the ffmpeg backend
//
// Another backend (a different binary, a remote service) only needs to
// implement `Encoder`.

pub mod commands;
pub mod ffmpeg;
pub mod progress;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub use commands::*;
pub use ffmpeg::FfmpegEncoder;
pub use progress::{ProgressReader, ProgressRecord, ProgressTracker, RecordAccumulator, RecordError};

use crate::cancel::CancelToken;
use crate::config::EncoderConfig;
use crate::error::Result;
use crate::job::ConversionTask;

/// Live progress of one running job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: usize,
    /// Media time encoded so far
    pub elapsed: Duration,
    /// Estimated media duration of the input, when it could be probed
    pub total: Option<Duration>,
    /// Bytes written to the output so far
    pub processed_bytes: u64,
    /// Encode speed as a multiple of realtime
    pub speed: Option<f64>,
    pub fps: Option<f64>,
}

impl ProgressEvent {
    /// Completion in [0, 1]; the encoder's estimate may overshoot at the end.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total?.as_secs_f64();
        if total <= 0.0 {
            return None;
        }
        Some((self.elapsed.as_secs_f64() / total).clamp(0.0, 1.0))
    }

    /// Wall-clock time left, from the remaining media time and the speed.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let speed = self.speed.filter(|s| *s > 0.0)?;
        let remaining = total.saturating_sub(self.elapsed).as_secs_f64();
        Duration::try_from_secs_f64(remaining / speed).ok()
    }
}

/// How an encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Success,
    /// Nonzero exit, or the process could not be run at all (`exit_code`
    /// is `None` when no exit code exists)
    Failure {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    /// Stopped on request
    Cancelled,
}

/// Capability to encode one task while reporting progress.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Run the encode to its end. Progress events go to `progress` in order;
    /// a closed receiver does not stop the encode.
    async fn encode(
        &self,
        task: &ConversionTask,
        progress: mpsc::Sender<ProgressEvent>,
        cancel: CancelToken,
    ) -> TerminalStatus;

    /// Version string of the backend; errors when it is not usable.
    async fn version(&self) -> Result<String>;
}

/// Encoder implementation type
#[derive(Debug, Clone)]
pub enum EncoderImplementation {
    Ffmpeg,
}

/// Factory for creating encoder instances
pub struct EncoderFactory;

impl EncoderFactory {
    pub fn create_encoder(
        implementation: EncoderImplementation,
        config: EncoderConfig,
    ) -> Box<dyn Encoder> {
        match implementation {
            EncoderImplementation::Ffmpeg => Box::new(FfmpegEncoder::new(config)),
        }
    }

    pub fn create_default(config: EncoderConfig) -> Box<dyn Encoder> {
        Self::create_encoder(EncoderImplementation::Ffmpeg, config)
    }
}
