// Terminal rendering of a batch.
//
// The engine only emits `BatchEvent`s; this sink turns them into an
// overall bar plus one bar per running job, and prints the plan and the
// final summary.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::encoder::ProgressEvent;
use crate::inventory::format_file_size;
use crate::job::JobOutcome;
use crate::report::BatchReport;
use crate::scheduler::BatchEvent;
use crate::workflow::{BatchPlan, BatchRun};

/// Resolution of per-job bars.
const JOB_BAR_LENGTH: u64 = 1000;

const OVERALL_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}";
const JOB_TEMPLATE: &str = "  {prefix:30!} [{bar:30.green/white}] {percent:>3}% {msg}";

pub struct ProgressDisplay {
    multi: MultiProgress,
    overall: ProgressBar,
    jobs: HashMap<usize, ProgressBar>,
    report: BatchReport,
    total_tasks: usize,
}

impl ProgressDisplay {
    pub fn new(total_tasks: usize) -> Self {
        Self::with_target(total_tasks, ProgressDrawTarget::stderr())
    }

    /// A display that tracks everything but draws nothing.
    pub fn hidden(total_tasks: usize) -> Self {
        Self::with_target(total_tasks, ProgressDrawTarget::hidden())
    }

    fn with_target(total_tasks: usize, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(total_tasks as u64));
        overall.set_style(bar_style(OVERALL_TEMPLATE));
        overall.enable_steady_tick(Duration::from_millis(200));

        Self {
            multi,
            overall,
            jobs: HashMap::new(),
            report: BatchReport::new(),
            total_tasks,
        }
    }

    /// Live totals over the jobs finished so far.
    pub fn report(&self) -> &BatchReport {
        &self.report
    }

    pub fn running(&self) -> usize {
        self.jobs.len()
    }

    pub fn handle(&mut self, event: BatchEvent) {
        match event {
            BatchEvent::Started { task_id, input } => {
                let bar = self.multi.add(ProgressBar::new(JOB_BAR_LENGTH));
                bar.set_style(bar_style(JOB_TEMPLATE));
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| input.display().to_string());
                bar.set_prefix(name);
                self.jobs.insert(task_id, bar);
            }
            BatchEvent::Progress(progress) => {
                if let Some(bar) = self.jobs.get(&progress.task_id) {
                    if let Some(fraction) = progress.fraction() {
                        bar.set_position((fraction * JOB_BAR_LENGTH as f64) as u64);
                    }
                    bar.set_message(job_message(&progress));
                }
            }
            BatchEvent::Finished(result) => {
                if let Some(bar) = self.jobs.remove(&result.task.id) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                let line = match &result.outcome {
                    JobOutcome::Completed => format!(
                        "✓ {} ({} -> {})",
                        result.task.input.file_name(),
                        format_file_size(result.input_size),
                        format_file_size(result.output_size)
                    ),
                    JobOutcome::Skipped => format!("- {} (already converted)", result.task.input.file_name()),
                    JobOutcome::Failed(reason) => {
                        format!("✗ {}: {}", result.task.input.file_name(), first_line(&reason.to_string()))
                    }
                };
                let _ = self.multi.println(line);

                self.report.accumulate(&result);
                self.overall.set_position(self.report.processed() as u64);
                self.overall.set_message(format!(
                    "({:.0}%)",
                    self.report.fraction_complete(self.total_tasks) * 100.0
                ));
            }
        }
    }

    /// Render events until the sender side is gone.
    pub async fn consume(mut self, mut events: mpsc::Receiver<BatchEvent>) -> BatchReport {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        self.finish()
    }

    pub fn finish(self) -> BatchReport {
        for bar in self.jobs.values() {
            bar.finish_and_clear();
        }
        self.overall.finish_and_clear();
        self.report
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Speed, position and ETA of one running job.
pub fn job_message(progress: &ProgressEvent) -> String {
    let position = match progress.total {
        Some(total) => format!(
            "{}/{}",
            format_timestamp(progress.elapsed),
            format_timestamp(total)
        ),
        None => format_timestamp(progress.elapsed),
    };
    let mut parts = vec![position];
    if let Some(speed) = progress.speed {
        parts.push(format!("{:.2}x", speed));
    }
    if progress.processed_bytes > 0 {
        parts.push(format_file_size(progress.processed_bytes));
    }
    if let Some(eta) = progress.eta() {
        parts.push(format!("ETA {}", format_duration(eta)));
    }
    parts.join("  ")
}

/// Print what a dry run would convert.
pub fn print_plan(plan: &BatchPlan) {
    for line in plan_lines(plan) {
        println!("{}", line);
    }
}

pub fn plan_lines(plan: &BatchPlan) -> Vec<String> {
    let mut lines = vec![format!(
        "Found {} files to convert in {} ({})",
        plan.tasks.len(),
        plan.input_dir.display(),
        format_file_size(plan.total_input_bytes())
    )];
    for task in &plan.tasks {
        lines.push(format!(
            "  {:<40} {:>12}  -> {}",
            task.input.file_name(),
            format_file_size(task.input.size),
            task.output_path.display()
        ));
    }
    lines.extend(exclusion_lines(plan));
    lines
}

pub fn print_summary(plan: &BatchPlan, run: &BatchRun) {
    for line in summary_lines(plan, run) {
        println!("{}", line);
    }
}

pub fn summary_lines(plan: &BatchPlan, run: &BatchRun) -> Vec<String> {
    let report = &run.report;
    let mut lines = vec![
        String::new(),
        if run.cancelled {
            "Conversion interrupted".to_string()
        } else {
            "Conversion finished".to_string()
        },
        "-".repeat(60),
        format!(
            "Completed: {}  Failed: {}  Skipped: {}",
            report.completed, report.failed, report.skipped
        ),
    ];
    if report.cancelled > 0 {
        lines.push(format!("Cancelled: {}", report.cancelled));
    }
    lines.push(format!(
        "Input size: {}  Output size: {}",
        format_file_size(report.total_input_bytes),
        format_file_size(report.total_output_bytes)
    ));

    let saved = report.space_saved();
    let saved_line = if saved >= 0 {
        format!("Space saved: {}", format_file_size(saved as u64))
    } else {
        format!("Space grew by: {}", format_file_size(saved.unsigned_abs()))
    };
    lines.push(match report.compression_ratio() {
        Some(ratio) => format!("{} (outputs are {:.1}% of their inputs)", saved_line, ratio),
        None => saved_line,
    });
    if report.skipped > 0 {
        lines.push(format!(
            "Not counted: {} of skipped inputs ({} files)",
            format_file_size(report.skipped_input_bytes),
            report.skipped
        ));
    }

    if let Some(wall) = report.wall_time {
        lines.push(format!(
            "Time: {} (encoding {})",
            format_duration(wall),
            format_duration(report.job_time)
        ));
    }
    lines.push(format!("Output: {}", plan.output_dir.display()));

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("Failed files:".to_string());
        for (path, diagnostic) in &report.failures {
            lines.push(format!("  {}", path.display()));
            for diag in diagnostic.lines() {
                lines.push(format!("      {}", diag));
            }
        }
    }
    lines.extend(exclusion_lines(plan));
    lines
}

fn exclusion_lines(plan: &BatchPlan) -> Vec<String> {
    if plan.excluded.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![String::new(), "Excluded files:".to_string()];
    for excluded in &plan.excluded {
        lines.push(format!("  {}: {}", excluded.path.display(), excluded.reason));
    }
    lines
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// `HH:MM:SS` media position.
fn format_timestamp(duration: Duration) -> String {
    let seconds = duration.as_secs();
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}
