// Bounded worker pool running conversion jobs.
//
// `workers` tasks pull from one FIFO queue. A worker claims the next task
// only when its current job reached a terminal state, so at most `workers`
// encoders run at any time. Failures never stop siblings; cancellation stops
// claiming, stops the running encoders and reports everything that did not
// finish as cancelled.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::cancel::CancelToken;
use crate::encoder::{Encoder, ProgressEvent};
use crate::job::{ConversionJob, ConversionTask, FailureReason, JobPolicy, JobResult};

/// Capacity of the per-job progress channel.
const PROGRESS_BUFFER: usize = 32;

/// Live notifications for display sinks.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Started { task_id: usize, input: PathBuf },
    Progress(ProgressEvent),
    Finished(JobResult),
}

pub struct BatchScheduler {
    encoder: Arc<dyn Encoder>,
    workers: usize,
    policy: JobPolicy,
}

impl BatchScheduler {
    pub fn new(encoder: Arc<dyn Encoder>, workers: usize, policy: JobPolicy) -> Self {
        Self {
            encoder,
            workers: workers.max(1),
            policy,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task to a terminal state. Results come back in completion
    /// order, one per task.
    pub async fn run(
        &self,
        tasks: Vec<ConversionTask>,
        events: Option<mpsc::Sender<BatchEvent>>,
        cancel: CancelToken,
    ) -> Vec<JobResult> {
        let total = tasks.len();
        let started = Instant::now();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let worker_count = self.workers.min(total.max(1));
        info!("Running {} tasks on {} workers", total, worker_count);

        let mut pool = JoinSet::new();
        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                encoder: Arc::clone(&self.encoder),
                policy: self.policy,
                queue: Arc::clone(&queue),
                results: results_tx.clone(),
                events: events.clone(),
                cancel: cancel.clone(),
            };
            pool.spawn(worker.run());
        }
        drop(results_tx);

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("Worker stopped unexpectedly: {}", e);
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }

        // Anything still queued was never claimed: only possible after a
        // cancellation or a worker breakdown.
        let leftover: Vec<ConversionTask> = lock_queue(&queue).drain(..).collect();
        for task in leftover {
            let result = JobResult::failed(
                task,
                FailureReason::Cancelled { started: false },
                std::time::Duration::ZERO,
            );
            emit(&events, BatchEvent::Finished(result.clone())).await;
            results.push(result);
        }

        info!(
            "Batch finished: {} results for {} tasks in {:.1}s",
            results.len(),
            total,
            started.elapsed().as_secs_f64()
        );
        results
    }
}

struct Worker {
    id: usize,
    encoder: Arc<dyn Encoder>,
    policy: JobPolicy,
    queue: Arc<Mutex<VecDeque<ConversionTask>>>,
    results: mpsc::UnboundedSender<JobResult>,
    events: Option<mpsc::Sender<BatchEvent>>,
    cancel: CancelToken,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Worker {} stops claiming: batch cancelled", self.id);
                break;
            }
            let next = lock_queue(&self.queue).pop_front();
            let Some(task) = next else {
                break;
            };

            debug!("Worker {} claimed task {}", self.id, task.id);
            emit(
                &self.events,
                BatchEvent::Started {
                    task_id: task.id,
                    input: task.input.path.clone(),
                },
            )
            .await;

            let result = self.run_job(task).await;
            emit(&self.events, BatchEvent::Finished(result.clone())).await;
            if self.results.send(result).is_err() {
                error!("Result sink closed; worker {} stopping", self.id);
                break;
            }
        }
    }

    /// Run one job in its own task so that a panic still yields a result.
    async fn run_job(&self, task: ConversionTask) -> JobResult {
        let started = Instant::now();
        let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_BUFFER);

        let job = ConversionJob::new(task.clone());
        let handle = tokio::spawn(job.run(
            Arc::clone(&self.encoder),
            self.policy,
            progress_tx,
            self.cancel.clone(),
        ));

        // The job drops its sender when it ends, which ends this loop.
        while let Some(event) = progress_rx.recv().await {
            emit(&self.events, BatchEvent::Progress(event)).await;
        }

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Job for {} broke down: {}", task.input.path.display(), e);
                JobResult::failed(task, FailureReason::Internal(e.to_string()), started.elapsed())
            }
        }
    }
}

fn lock_queue(
    queue: &Mutex<VecDeque<ConversionTask>>,
) -> std::sync::MutexGuard<'_, VecDeque<ConversionTask>> {
    // A poisoned queue still holds valid tasks.
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn emit(events: &Option<mpsc::Sender<BatchEvent>>, event: BatchEvent) {
    if let Some(tx) = events {
        // The display going away must not stall the batch.
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSignal;
    use crate::config::EncoderConfig;
    use crate::encoder::TerminalStatus;
    use crate::inventory::InputFile;
    use crate::job::{EncodeParams, JobOutcome, JobState};
    use crate::report::BatchReport;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Encoder double: files whose name contains "bad" fail, "panic" panics,
    /// "slow" report once and wait for cancellation; others write a half-size
    /// output.
    #[derive(Default)]
    struct ScriptedEncoder {
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Encoder for ScriptedEncoder {
        async fn encode(
            &self,
            task: &ConversionTask,
            progress: mpsc::Sender<ProgressEvent>,
            mut cancel: CancelToken,
        ) -> TerminalStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let name = task.input.file_name();
            let status = if name.contains("panic") {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("encoder crashed on {}", name);
            } else if name.contains("slow") {
                let _ = progress
                    .send(ProgressEvent {
                        task_id: task.id,
                        elapsed: Duration::ZERO,
                        total: None,
                        processed_bytes: 0,
                        speed: None,
                        fps: None,
                    })
                    .await;
                cancel.cancelled().await;
                TerminalStatus::Cancelled
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = progress
                    .send(ProgressEvent {
                        task_id: task.id,
                        elapsed: Duration::from_secs(1),
                        total: Some(Duration::from_secs(2)),
                        processed_bytes: 1,
                        speed: Some(1.0),
                        fps: None,
                    })
                    .await;
                if name.contains("bad") {
                    TerminalStatus::Failure {
                        exit_code: Some(1),
                        diagnostic: "Invalid data found when processing input".to_string(),
                    }
                } else {
                    std::fs::write(&task.output_path, vec![0u8; (task.input.size / 2) as usize])
                        .unwrap();
                    TerminalStatus::Success
                }
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            status
        }

        async fn version(&self) -> crate::error::Result<String> {
            Ok("scripted".to_string())
        }
    }

    fn tasks(dir: &Path, names: &[&str]) -> Vec<ConversionTask> {
        let output_dir = dir.join("output");
        std::fs::create_dir_all(&output_dir).unwrap();
        names
            .iter()
            .enumerate()
            .map(|(id, name)| {
                let path = dir.join(name);
                std::fs::write(&path, vec![1u8; 100]).unwrap();
                let input = InputFile {
                    path,
                    size: 100,
                    discovered_at: Utc::now(),
                };
                ConversionTask::new(
                    id,
                    input,
                    &output_dir,
                    "mp4",
                    EncodeParams::from_config(&EncoderConfig::default()),
                )
            })
            .collect()
    }

    fn assert_conserved(tasks: &[ConversionTask], results: &[JobResult]) {
        assert_eq!(results.len(), tasks.len());
        let ids: HashSet<usize> = results.iter().map(|r| r.task.id).collect();
        assert_eq!(ids.len(), tasks.len());
        for result in results {
            assert!(result.outcome.state().is_terminal());
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks(dir.path(), &["a.avi", "bad.avi", "c.avi", "d.avi"]);
        let encoder = Arc::new(ScriptedEncoder::default());
        let scheduler = BatchScheduler::new(encoder.clone(), 1, JobPolicy::default());

        let results = scheduler.run(tasks.clone(), None, CancelToken::never()).await;

        assert_conserved(&tasks, &results);
        let report = BatchReport::from_results(&results);
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 4);
        assert_eq!(encoder.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("clip{}.avi", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let tasks = tasks(dir.path(), &names);
        let encoder = Arc::new(ScriptedEncoder::default());
        let scheduler = BatchScheduler::new(encoder.clone(), 3, JobPolicy::default());

        let results = scheduler.run(tasks.clone(), None, CancelToken::never()).await;

        assert_conserved(&tasks, &results);
        assert!(encoder.max_running.load(Ordering::SeqCst) <= 3);
        assert!(results.iter().all(|r| r.outcome == JobOutcome::Completed));
    }

    #[tokio::test]
    async fn test_second_resumed_run_encodes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks(dir.path(), &["a.avi", "b.avi", "c.avi"]);
        let policy = JobPolicy {
            resume: true,
            ..Default::default()
        };

        let first = Arc::new(ScriptedEncoder::default());
        let results = BatchScheduler::new(first.clone(), 2, policy)
            .run(tasks.clone(), None, CancelToken::never())
            .await;
        assert!(results.iter().all(|r| r.outcome == JobOutcome::Completed));

        let second = Arc::new(ScriptedEncoder::default());
        let results = BatchScheduler::new(second.clone(), 2, policy)
            .run(tasks.clone(), None, CancelToken::never())
            .await;

        assert_conserved(&tasks, &results);
        assert!(results.iter().all(|r| r.outcome == JobOutcome::Skipped));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_accounts_for_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks(dir.path(), &["slow1.avi", "slow2.avi", "c.avi", "d.avi", "e.avi"]);
        let encoder = Arc::new(ScriptedEncoder::default());
        let scheduler = BatchScheduler::new(encoder.clone(), 2, JobPolicy::default());
        let (signal, token) = CancelSignal::new();
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let run = scheduler.run(tasks.clone(), Some(events_tx), token);
        let interrupt = async {
            let mut reporting = 0;
            while let Some(event) = events_rx.recv().await {
                if matches!(event, BatchEvent::Progress(_)) {
                    reporting += 1;
                    if reporting == 2 {
                        signal.cancel();
                    }
                }
            }
        };
        let (results, ()) = tokio::join!(run, interrupt);

        assert_conserved(&tasks, &results);
        let report = BatchReport::from_results(&results);
        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 5);
        assert_eq!(report.cancelled, 5);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);

        let in_flight: Vec<&JobResult> = results
            .iter()
            .filter(|r| r.outcome == JobOutcome::Failed(FailureReason::Cancelled { started: true }))
            .collect();
        assert_eq!(in_flight.len(), 2);
    }

    #[tokio::test]
    async fn test_job_panic_becomes_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks(dir.path(), &["a.avi", "panic.avi", "c.avi"]);
        let encoder = Arc::new(ScriptedEncoder::default());
        let scheduler = BatchScheduler::new(encoder, 1, JobPolicy::default());

        let results = scheduler.run(tasks.clone(), None, CancelToken::never()).await;

        assert_conserved(&tasks, &results);
        let broken = results.iter().find(|r| r.task.id == 1).unwrap();
        assert!(matches!(
            broken.outcome,
            JobOutcome::Failed(FailureReason::Internal(_))
        ));
        assert_eq!(broken.outcome.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn test_events_follow_job_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = tasks(dir.path(), &["a.avi", "b.avi"]);
        let scheduler = BatchScheduler::new(Arc::new(ScriptedEncoder::default()), 1, JobPolicy::default());
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let results = scheduler.run(tasks, Some(events_tx), CancelToken::never()).await;
        assert_eq!(results.len(), 2);

        let mut events = Vec::new();
        while let Some(event) = events_rx.recv().await {
            events.push(event);
        }
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                BatchEvent::Started { .. } => "started",
                BatchEvent::Progress(_) => "progress",
                BatchEvent::Finished(_) => "finished",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["started", "progress", "finished", "started", "progress", "finished"]
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let scheduler = BatchScheduler::new(Arc::new(ScriptedEncoder::default()), 4, JobPolicy::default());
        let results = scheduler.run(Vec::new(), None, CancelToken::never()).await;
        assert!(results.is_empty());
    }
}
