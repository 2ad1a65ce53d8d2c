// Batch totals.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::job::{JobOutcome, JobResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed jobs whose reason is a cancellation
    pub cancelled: usize,
    /// Input bytes of every result except skipped ones
    pub total_input_bytes: u64,
    /// Input bytes of skipped jobs, already converted by an earlier run
    pub skipped_input_bytes: u64,
    /// Output bytes of completed jobs
    pub total_output_bytes: u64,
    /// Input bytes of completed jobs only
    pub completed_input_bytes: u64,
    /// Sum of per-job durations
    pub job_time: Duration,
    /// Wall time of the whole batch, set once it is over
    pub wall_time: Option<Duration>,
    /// Failure description per input file
    pub failures: BTreeMap<PathBuf, String>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a JobResult>,
    {
        let mut report = Self::new();
        for result in results {
            report.accumulate(result);
        }
        report
    }

    pub fn accumulate(&mut self, result: &JobResult) {
        self.job_time += result.duration;

        match &result.outcome {
            JobOutcome::Completed => {
                self.completed += 1;
                self.total_input_bytes += result.input_size;
                self.total_output_bytes += result.output_size;
                self.completed_input_bytes += result.input_size;
            }
            JobOutcome::Failed(reason) => {
                self.failed += 1;
                self.total_input_bytes += result.input_size;
                if result.outcome.is_cancelled() {
                    self.cancelled += 1;
                }
                self.failures
                    .insert(result.task.input.path.clone(), reason.to_string());
            }
            JobOutcome::Skipped => {
                self.skipped += 1;
                self.skipped_input_bytes += result.input_size;
            }
        }
    }

    pub fn finish(&mut self, wall_time: Duration) {
        self.wall_time = Some(wall_time);
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    /// Share of the batch that reached a terminal state.
    pub fn fraction_complete(&self, total_tasks: usize) -> f64 {
        if total_tasks == 0 {
            return 1.0;
        }
        (self.processed() as f64 / total_tasks as f64).min(1.0)
    }

    /// Input bytes minus output bytes; negative when re-encoding grew the files.
    pub fn space_saved(&self) -> i64 {
        self.total_input_bytes as i64 - self.total_output_bytes as i64
    }

    /// Output size of completed jobs relative to their input, in percent.
    pub fn compression_ratio(&self) -> Option<f64> {
        (self.completed_input_bytes > 0)
            .then(|| self.total_output_bytes as f64 / self.completed_input_bytes as f64 * 100.0)
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
