// Incremental parser for ffmpeg's `-progress` protocol.
//
// The encoder writes newline-delimited `key=value` lines. A record ends with
// `progress=continue` or `progress=end`. The accumulator only hands out a
// record at that boundary; a record with a malformed line is dropped whole
// and the next one starts clean.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use super::ProgressEvent;

/// One complete status record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressRecord {
    pub out_time: Option<Duration>,
    pub total_size: Option<u64>,
    pub speed: Option<f64>,
    pub fps: Option<f64>,
    /// `progress=end` was seen
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The record contained a line that is not `key=value`
    BadLine(String),
    /// A known key carried a value that does not parse
    BadValue { key: String, value: String },
    /// `progress=` carried something other than `continue`/`end`
    BadTerminator(String),
}

#[derive(Debug, Default)]
struct PendingRecord {
    out_time_us: Option<Duration>,
    out_time: Option<Duration>,
    out_time_ms: Option<Duration>,
    total_size: Option<u64>,
    speed: Option<f64>,
    fps: Option<f64>,
    error: Option<RecordError>,
}

impl PendingRecord {
    fn poison(&mut self, error: RecordError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn finish(self, is_final: bool) -> Result<ProgressRecord, RecordError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(ProgressRecord {
            out_time: self.out_time_us.or(self.out_time).or(self.out_time_ms),
            total_size: self.total_size,
            speed: self.speed,
            fps: self.fps,
            is_final,
        })
    }
}

/// Line-fed record accumulator, independent of the transport.
#[derive(Debug, Default)]
pub struct RecordAccumulator {
    pending: PendingRecord,
    started: bool,
}

impl RecordAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns a finished record (or its error) when the line
    /// closes a record, `None` otherwise.
    pub fn feed_line(&mut self, line: &str) -> Option<Result<ProgressRecord, RecordError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.started = true;

        let Some((key, value)) = line.split_once('=') else {
            self.pending.poison(RecordError::BadLine(line.to_string()));
            return None;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            self.pending.poison(RecordError::BadLine(line.to_string()));
            return None;
        }

        if key == "progress" {
            let pending = std::mem::take(&mut self.pending);
            self.started = false;
            return Some(match value {
                "continue" => pending.finish(false),
                "end" => pending.finish(true),
                other => Err(pending
                    .error
                    .unwrap_or_else(|| RecordError::BadTerminator(other.to_string()))),
            });
        }

        if value == "N/A" {
            return None;
        }

        let parsed = match key {
            "out_time_us" => parse_microseconds(value).map(|d| self.pending.out_time_us = Some(d)),
            "out_time_ms" => parse_microseconds(value).map(|d| self.pending.out_time_ms = Some(d)),
            "out_time" => parse_timestamp(value).map(|d| self.pending.out_time = Some(d)),
            "total_size" => value.parse::<u64>().ok().map(|n| self.pending.total_size = Some(n)),
            "speed" => parse_speed(value).map(|s| self.pending.speed = Some(s)),
            "fps" => value.parse::<f64>().ok().map(|f| self.pending.fps = Some(f)),
            _ => Some(()),
        };
        if parsed.is_none() {
            self.pending.poison(RecordError::BadValue {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        None
    }

    /// Whether lines of an unfinished record are buffered.
    pub fn has_partial(&self) -> bool {
        self.started
    }
}

/// Microsecond counter; negative values (seen at stream start) clamp to zero.
fn parse_microseconds(value: &str) -> Option<Duration> {
    let micros = value.parse::<i64>().ok()?;
    Some(Duration::from_micros(micros.max(0) as u64))
}

/// `HH:MM:SS.ffffff`, optionally negative.
pub fn parse_timestamp(value: &str) -> Option<Duration> {
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let mut parts = value.split(':');
    let hours = parts.next()?.parse::<u64>().ok()?;
    let minutes = parts.next()?.parse::<u64>().ok()?;
    let seconds = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    if negative {
        return Some(Duration::ZERO);
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

/// `1.25x` or `1.25`
fn parse_speed(value: &str) -> Option<f64> {
    let speed = value.trim_end_matches('x').trim().parse::<f64>().ok()?;
    (speed.is_finite() && speed >= 0.0).then_some(speed)
}

/// Async record reader over any buffered byte stream (pipe, file, socket).
pub struct ProgressReader<R> {
    reader: R,
    line: Vec<u8>,
    accumulator: RecordAccumulator,
    dropped: usize,
}

impl<R: AsyncBufRead + Unpin> ProgressReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(128),
            accumulator: RecordAccumulator::new(),
            dropped: 0,
        }
    }

    /// Next well-formed record, or `None` at end of stream. A trailing
    /// partial record is discarded. Invalid UTF-8 is decoded lossily so it
    /// only ever spoils the record it appears in.
    pub async fn next_record(&mut self) -> std::io::Result<Option<ProgressRecord>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&self.line);
            match self.accumulator.feed_line(&line) {
                Some(Ok(record)) => return Ok(Some(record)),
                Some(Err(error)) => {
                    self.dropped += 1;
                    debug!("Dropping malformed progress record: {:?}", error);
                }
                None => {}
            }
        }
        if self.accumulator.has_partial() {
            debug!("Progress stream closed inside a record; discarding it");
        }
        Ok(None)
    }

    /// Number of malformed records dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Turns records of one job into monotonic progress events.
#[derive(Debug)]
pub struct ProgressTracker {
    task_id: usize,
    total: Option<Duration>,
    last_elapsed: Duration,
}

impl ProgressTracker {
    pub fn new(task_id: usize, total: Option<Duration>) -> Self {
        Self {
            task_id,
            total,
            last_elapsed: Duration::ZERO,
        }
    }

    /// Event for a record, or `None` when it carries no elapsed time.
    pub fn event(&mut self, record: &ProgressRecord) -> Option<ProgressEvent> {
        let elapsed = record.out_time?.max(self.last_elapsed);
        self.last_elapsed = elapsed;
        Some(ProgressEvent {
            task_id: self.task_id,
            elapsed,
            total: self.total,
            processed_bytes: record.total_size.unwrap_or(0),
            speed: record.speed,
            fps: record.fps,
        })
    }
}
