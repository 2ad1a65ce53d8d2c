use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::encoder::{Encoder, EncoderFactory};
use crate::error::Result;
use crate::inventory::{ExcludedFile, FileInventory};
use crate::job::{ConversionTask, EncodeParams, JobPolicy, JobResult};
use crate::report::BatchReport;
use crate::scheduler::{BatchEvent, BatchScheduler};

/// Everything discovery decided about a batch before any encode runs.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tasks: Vec<ConversionTask>,
    pub excluded: Vec<ExcludedFile>,
}

impl BatchPlan {
    pub fn total_input_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.input.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchRun {
    pub results: Vec<JobResult>,
    pub report: BatchReport,
    /// The batch was interrupted before every task could run
    pub cancelled: bool,
}

#[derive(Debug)]
pub enum BatchOutcome {
    /// Dry run: the plan only
    Planned(BatchPlan),
    Finished { plan: BatchPlan, run: BatchRun },
}

pub struct Workflow {
    config: Config,
    encoder: Arc<dyn Encoder>,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        let encoder: Arc<dyn Encoder> =
            Arc::from(EncoderFactory::create_default(config.encoder.clone()));
        Self::with_encoder(config, encoder)
    }

    /// Build a workflow around an existing encoder backend.
    pub fn with_encoder(config: Config, encoder: Arc<dyn Encoder>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn encoder(&self) -> Arc<dyn Encoder> {
        Arc::clone(&self.encoder)
    }

    /// Discover inputs and derive one task per accepted file.
    pub fn plan(&self) -> Result<BatchPlan> {
        let batch = &self.config.batch;
        let output_dir = batch.resolved_output_dir();
        let inventory = FileInventory::new(&batch.input_dir, &output_dir, &batch.input_extensions)?;
        let discovery = inventory.discover();

        let params = EncodeParams::from_config(&self.config.encoder);
        let tasks: Vec<ConversionTask> = discovery
            .files
            .into_iter()
            .enumerate()
            .map(|(id, input)| {
                ConversionTask::new(
                    id,
                    input,
                    inventory.output_dir(),
                    &batch.output_extension,
                    params.clone(),
                )
            })
            .collect();

        info!(
            "Planned {} tasks ({} excluded) from {}",
            tasks.len(),
            discovery.excluded.len(),
            inventory.input_dir().display()
        );

        Ok(BatchPlan {
            input_dir: inventory.input_dir().to_path_buf(),
            output_dir: inventory.output_dir().to_path_buf(),
            tasks,
            excluded: discovery.excluded,
        })
    }

    /// Run every task of `plan` through the worker pool.
    pub async fn run(
        &self,
        plan: &BatchPlan,
        events: Option<mpsc::Sender<BatchEvent>>,
        cancel: CancelToken,
    ) -> BatchRun {
        let batch = &self.config.batch;
        let policy = JobPolicy {
            resume: batch.resume,
            delete_originals: batch.delete_originals,
            remove_partial_output: batch.remove_partial_output,
        };
        let scheduler = BatchScheduler::new(Arc::clone(&self.encoder), batch.workers, policy);

        let started = Instant::now();
        let results = scheduler.run(plan.tasks.clone(), events, cancel.clone()).await;

        let mut report = BatchReport::from_results(&results);
        report.finish(started.elapsed());

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!(
                "Batch interrupted: {} of {} tasks cancelled",
                report.cancelled,
                plan.tasks.len()
            );
        }
        info!(
            "Batch done: {} completed, {} failed, {} skipped",
            report.completed, report.failed, report.skipped
        );

        BatchRun {
            results,
            report,
            cancelled,
        }
    }

    /// Plan, then run unless this is a dry run.
    pub async fn execute(
        &self,
        events: Option<mpsc::Sender<BatchEvent>>,
        cancel: CancelToken,
    ) -> Result<BatchOutcome> {
        let plan = self.plan()?;
        if self.config.batch.dry_run {
            info!("Dry run: {} files would be converted", plan.tasks.len());
            return Ok(BatchOutcome::Planned(plan));
        }

        let run = self.run(&plan, events, cancel).await;
        Ok(BatchOutcome::Finished { plan, run })
    }
}
