use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Encoder, EncoderCommandBuilder, ProgressEvent, ProgressReader, ProgressTracker, TerminalStatus,
};
use crate::cancel::CancelToken;
use crate::config::EncoderConfig;
use crate::error::{ConvertError, Result};
use crate::job::ConversionTask;

/// How long to keep draining stderr after the process is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded tail of the encoder's diagnostic output.
#[derive(Debug)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DiagnosticTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse the `-of json` output of a `format=duration` probe.
fn parse_probe_duration(json: &str) -> Result<Option<Duration>> {
    let output: ProbeOutput = serde_json::from_str(json)?;
    Ok(output
        .format
        .duration
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok()))
}

/// Extract the version token from `ffmpeg -version` output.
fn parse_version(output: &str) -> Option<String> {
    let first_line = output.lines().next()?;
    let mut words = first_line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "version" {
            return words.next().map(str::to_string);
        }
    }
    None
}

/// ffmpeg-backed encoder
pub struct FfmpegEncoder {
    config: EncoderConfig,
    command_builder: EncoderCommandBuilder,
}

impl FfmpegEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let command_builder = EncoderCommandBuilder::new(&config.binary_path, &config.probe_path);

        Self {
            config,
            command_builder,
        }
    }

    /// Media duration of `input`, if ffprobe can tell.
    pub async fn probe_duration(&self, input: &Path) -> Option<Duration> {
        let command = self.command_builder.probe_duration(input);
        debug!("Executing {}: {} {:?}", command.description, command.binary_path, command.args);

        let output = match tokio::process::Command::new(&command.binary_path)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!("Duration probe unavailable for {}: {}", input.display(), e);
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "Duration probe failed for {}: {}",
                input.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        match parse_probe_duration(&String::from_utf8_lossy(&output.stdout)) {
            Ok(duration) => duration,
            Err(e) => {
                debug!("Unreadable duration probe output for {}: {}", input.display(), e);
                None
            }
        }
    }

    fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.grace_period_secs)
    }

    /// Ask ffmpeg to quit, then kill it if it does not exit in time.
    async fn stop(&self, child: &mut Child, stdin: Option<ChildStdin>) {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!("Could not send quit request to encoder: {}", e);
            }
            // Closing stdin also signals end of input to the encoder.
            drop(stdin);
        }

        match tokio::time::timeout(self.grace_period(), child.wait()).await {
            Ok(Ok(status)) => debug!("Encoder stopped gracefully with {}", status),
            Ok(Err(e)) => warn!("Failed waiting for encoder to stop: {}", e),
            Err(_) => {
                warn!(
                    "Encoder did not stop within {:?}, killing it",
                    self.grace_period()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill encoder: {}", e);
                }
            }
        }
    }
}

/// Collect the last `capacity` lines of a diagnostic stream.
fn spawn_diagnostic_reader<R>(stream: R, capacity: usize) -> JoinHandle<DiagnosticTail>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = DiagnosticTail::new(capacity);
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if !line.is_empty() {
                        tail.push(line);
                    }
                }
                Err(e) => {
                    tail.push(format!("<diagnostic stream error: {}>", e));
                    break;
                }
            }
        }
        tail
    })
}

async fn collect_diagnostic(handle: Option<JoinHandle<DiagnosticTail>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(tail)) => tail.render(),
        Ok(Err(e)) => format!("<diagnostic reader failed: {}>", e),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        task: &ConversionTask,
        progress: mpsc::Sender<ProgressEvent>,
        mut cancel: CancelToken,
    ) -> TerminalStatus {
        let total = self.probe_duration(&task.input.path).await;
        let command = self.command_builder.encode(task);
        debug!("Executing {}: {} {:?}", command.description, command.binary_path, command.args);

        let mut child = match command.to_process().spawn() {
            Ok(child) => child,
            Err(e) => {
                let diagnostic = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("Encoder executable not found: {}", command.binary_path)
                } else {
                    format!("Failed to launch encoder {}: {}", command.binary_path, e)
                };
                return TerminalStatus::Failure {
                    exit_code: None,
                    diagnostic,
                };
            }
        };

        let stdin = child.stdin.take();
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| spawn_diagnostic_reader(stderr, self.config.diagnostic_lines));
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return TerminalStatus::Failure {
                exit_code: None,
                diagnostic: "Encoder status channel was not captured".to_string(),
            };
        };

        let mut reader = ProgressReader::new(BufReader::new(stdout));
        let mut tracker = ProgressTracker::new(task.id, total);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancelling encode of {}", task.input.path.display());
                    self.stop(&mut child, stdin).await;
                    collect_diagnostic(diagnostics).await;
                    return TerminalStatus::Cancelled;
                }
                record = reader.next_record() => match record {
                    Ok(Some(record)) => {
                        if let Some(event) = tracker.event(&record) {
                            // A closed receiver only means nobody is watching.
                            let _ = progress.send(event).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Encoder status channel failed for {}: {}", task.input.path.display(), e);
                        let _ = child.kill().await;
                        let tail = collect_diagnostic(diagnostics).await;
                        return TerminalStatus::Failure {
                            exit_code: None,
                            diagnostic: join_diagnostic(&format!("Status channel error: {}", e), &tail),
                        };
                    }
                },
            }
        }

        if reader.dropped() > 0 {
            debug!(
                "Dropped {} malformed progress records for {}",
                reader.dropped(),
                task.input.path.display()
            );
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.stop(&mut child, stdin).await;
                collect_diagnostic(diagnostics).await;
                return TerminalStatus::Cancelled;
            }
            status = child.wait() => status,
        };
        drop(stdin);
        let tail = collect_diagnostic(diagnostics).await;

        match status {
            Ok(status) if status.success() => TerminalStatus::Success,
            Ok(status) => TerminalStatus::Failure {
                exit_code: status.code(),
                diagnostic: if tail.is_empty() {
                    format!("Encoder exited with {}", status)
                } else {
                    tail
                },
            },
            Err(e) => TerminalStatus::Failure {
                exit_code: None,
                diagnostic: join_diagnostic(&format!("Failed waiting for encoder: {}", e), &tail),
            },
        }
    }

    async fn version(&self) -> Result<String> {
        let command = self.command_builder.version_check();
        let output = tokio::process::Command::new(&command.binary_path)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ConvertError::EncoderNotFound {
                        path: PathBuf::from(&command.binary_path),
                    }
                } else {
                    ConvertError::EncoderUnavailable(format!(
                        "Failed to execute {}: {}",
                        command.binary_path, e
                    ))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConvertError::EncoderUnavailable(format!(
                "Version check failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_version(&stdout).unwrap_or_else(|| "unknown".to_string()))
    }
}

fn join_diagnostic(message: &str, tail: &str) -> String {
    if tail.is_empty() {
        message.to_string()
    } else {
        format!("{}\n{}", message, tail)
    }
}
