use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};
use sweep::{
    backends::Backends,
    config::{BatchFile, ConfigErrors, DispatcherConfig},
    context::LoggingContext,
    git::GitStateGuard,
    job::{JobSpec, RunIdentity},
    overrides::{self, YamlSchema},
    tracker::{RunState, TrackerError, Trackers},
    dispatch::DispatchResult,
    DispatchError, DispatchReport, Dispatcher, Outcome,
};
use thiserror::Error;
use tracing::{error, info, level_filters::LevelFilter};

#[derive(Parser)]
#[command(name = "sweep", version, about = "Dispatch batches of experiment runs")]
struct Cli {
    /// Dispatcher config file
    #[arg(short, long, global = true, default_value = "sweep.yaml")]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, deduplicate and submit a batch
    Dispatch {
        /// Batch file
        batch: PathBuf,

        /// Only print what would be submitted
        #[arg(long)]
        dry_run: bool,

        /// Do not require a clean git working tree
        #[arg(long)]
        skip_git_checks: bool,
    },

    /// Only check the overrides of a batch against the config schema
    Validate {
        /// Batch file
        batch: PathBuf,
    },

    /// List all runs of an experiment known to the tracker
    Runs { experiment: String },

    /// Record the state of a run in the tracker
    Mark {
        experiment: String,
        run: String,
        /// unknown, pending, running, finished or failed
        state: String,
    },
}

#[derive(Error, Debug)]
enum Failure {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    InvalidState(TrackerError),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Dispatch(DispatchError::InvalidBatch(_) | DispatchError::InvalidOverride(_))
            | Self::InvalidState(_) => 1,
            Self::Dispatch(DispatchError::ResourceArity(_)) => 2,
            Self::Dispatch(DispatchError::TrackerUnavailable(_)) | Self::Tracker(_) => 4,
            Self::Dispatch(DispatchError::Git(_)) => 5,
            Self::Config(_) => 6,
        }
    }
}

/// exit code when at least one job failed to submit
const PARTIAL_FAILURE: u8 = 3;

/// One report line per override set
fn describe(result: &DispatchResult, job: Option<&JobSpec>) -> String {
    let gpu = job
        .and_then(|job| job.resources.gpu)
        .map(|gpu| format!(" [gpu {gpu}]"))
        .unwrap_or_default();

    match &result.outcome {
        Outcome::SkippedDuplicate => format!("{}: skipped, already exists", result.run),
        Outcome::SkippedRepeat => format!("{}: skipped, repeated in this batch", result.run),
        Outcome::Simulated { command } => {
            format!("{}{gpu}: would run {}", result.run, command.join(" "))
        }
        Outcome::Submitted { job_id } => format!("{}{gpu}: submitted as {job_id}", result.run),
        Outcome::SubmitFailed { reason } => format!("{}{gpu}: FAILED {reason}", result.run),
    }
}

fn print_report(report: &DispatchReport) {
    for result in &report.results {
        let job = report.jobs.iter().find(|job| job.run == result.run);

        println!("{}", describe(result, job));
    }

    let summary = report.summary;
    println!();
    println!(
        "Total: {} | submitted: {} | simulated: {} | skipped: {} | failed: {}",
        summary.total, summary.submitted, summary.simulated, summary.skipped, summary.failed
    );
}

fn run(cli: Cli) -> Result<u8, Failure> {
    let config = DispatcherConfig::load(&cli.config)?;

    match cli.command {
        Commands::Dispatch {
            batch,
            dry_run,
            skip_git_checks,
        } => {
            let mut batch = BatchFile::load(&batch)?.into_batch();
            batch.dry_run |= dry_run;
            batch.skip_git_checks |= skip_git_checks;

            let schema = YamlSchema::load(&config.schema)?;
            let tracker = Trackers::load(&config.tracker).map_err(DispatchError::from)?;
            let backend = Backends::load(&config.backend);
            let guard = GitStateGuard::new(&config.repository);

            let dispatcher =
                Dispatcher::new(&schema, &tracker, &backend, &guard, config.entrypoint.clone());
            let report = dispatcher.run(&batch)?;

            print_report(&report);

            Ok(if report.has_failures() { PARTIAL_FAILURE } else { 0 })
        }
        Commands::Validate { batch } => {
            let batch = BatchFile::load(&batch)?.into_batch();
            let schema = YamlSchema::load(&config.schema)?;

            overrides::validate(&batch.overrides, &schema).map_err(DispatchError::from)?;
            batch
                .resources
                .assign(batch.overrides.len())
                .map_err(DispatchError::from)?;

            println!("{} override sets are valid", batch.overrides.len());

            Ok(0)
        }
        Commands::Runs { experiment } => {
            let runs = Trackers::load(&config.tracker)?.runs(&experiment)?;

            if runs.is_empty() {
                println!("No runs for {experiment}");
            }
            for (run, state) in runs {
                println!("{run}: {state}");
            }

            Ok(0)
        }
        Commands::Mark {
            experiment,
            run,
            state,
        } => {
            let state: RunState = state.parse().map_err(Failure::InvalidState)?;

            Trackers::load(&config.tracker)?.record(&experiment, &RunIdentity::from(run), state)?;
            info!(experiment = %experiment, state = %state, "Updated run state");

            Ok(0)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logging = LoggingContext::new(cli.log_level);

    let code = match run(cli) {
        Ok(code) => code,
        Err(failure) => {
            error!("{failure}");

            failure.exit_code()
        }
    };

    info!(code = code, "Exiting");
    logging.teardown();

    ExitCode::from(code)
}
