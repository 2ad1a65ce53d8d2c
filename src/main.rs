//! recast - batch video conversion
//!
//! Entry point of the `recast` binary: converts every matching video in a
//! directory with ffmpeg, showing live progress and a final savings report.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use recast::cancel::CancelSignal;
use recast::cli::{Args, Commands};
use recast::config::{normalize_scale, Config, Preset};
use recast::display::{self, ProgressDisplay};
use recast::encoder::EncoderFactory;
use recast::setup::SetupManager;
use recast::workflow::Workflow;

const DEFAULT_CONFIG_FILE: &str = "recast.toml";
const EVENT_BUFFER: usize = 256;

/// Exit status after a user interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _guard = match setup_logging(args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    info!("Starting recast {}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_deref())?;
    let setup_manager = SetupManager::new();

    match args.command {
        Commands::Check => {
            setup_manager.initialize(&mut config);
            let encoder = EncoderFactory::create_default(config.encoder.clone());
            let version = setup_manager.verify(encoder.as_ref()).await?;
            println!("ffmpeg {} ({})", version, config.encoder.binary_path);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Convert {
            input_dir,
            output_dir,
            preset,
            crf,
            workers,
            dry_run,
            delete_originals,
            resume,
            scale,
            remove_partial,
        } => {
            if let Some(dir) = input_dir {
                config.batch.input_dir = dir;
            }
            if let Some(dir) = output_dir {
                config.batch.output_dir = Some(dir);
            }
            if let Some(preset) = preset {
                config.encoder.preset = preset.parse::<Preset>()?;
            }
            if let Some(crf) = crf {
                config.encoder.crf = crf;
            }
            if let Some(workers) = workers {
                config.batch.workers = workers;
            }
            if let Some(scale) = scale {
                config.encoder.scale = Some(normalize_scale(&scale));
            }
            config.batch.dry_run |= dry_run;
            config.batch.delete_originals |= delete_originals;
            config.batch.resume |= resume;
            config.batch.remove_partial_output |= remove_partial;

            setup_manager.initialize(&mut config);
            convert(config, &setup_manager).await
        }
    }
}

async fn convert(config: Config, setup_manager: &SetupManager) -> Result<ExitCode> {
    let workflow = Workflow::new(config)?;
    let plan = workflow.plan()?;

    if workflow.config().batch.dry_run {
        display::print_plan(&plan);
        return Ok(ExitCode::SUCCESS);
    }

    let version = setup_manager.verify(workflow.encoder().as_ref()).await?;
    info!("Using ffmpeg {}", version);

    if plan.is_empty() {
        println!("No files to convert in {}", plan.input_dir.display());
        display::print_plan(&plan);
        return Ok(ExitCode::SUCCESS);
    }
    display::print_plan(&plan);

    let (signal, token) = CancelSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping running conversions");
            eprintln!("\nInterrupted: stopping running conversions...");
            signal.cancel();
        }
    });

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let progress = ProgressDisplay::new(plan.tasks.len());
    let renderer = tokio::spawn(progress.consume(events_rx));

    let batch = workflow.run(&plan, Some(events_tx), token).await;
    if let Err(e) = renderer.await {
        warn!("Progress display stopped: {}", e);
    }

    display::print_summary(&plan, &batch);

    if batch.cancelled {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Load configuration from the given file, `./recast.toml`, or defaults
fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
            Config::from_file(DEFAULT_CONFIG_FILE)?
        }
        None => Config::default(),
    };
    Ok(config)
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<WorkerGuard> {
    let log_dir = std::env::current_dir()?.join(".recast").join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Set up file appender with daily rotation
    let file_appender = rolling::daily(&log_dir, "recast.log");
    let (non_blocking_file, guard) = non_blocking(file_appender);

    let console_level = if verbose { Level::DEBUG } else { Level::WARN };
    let file_level = if verbose { Level::DEBUG } else { Level::INFO };

    // The console shares stderr with the progress bars, so keep it quiet
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::from_default_env().add_directive(console_level.into()));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_filter(EnvFilter::from_default_env().add_directive(file_level.into()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Logging initialized - console: {}, file: {}",
        console_level,
        log_dir.join("recast.log").display()
    );

    Ok(guard)
}
