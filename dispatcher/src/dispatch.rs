use crate::{
    backends::SubmitBackend,
    counter::Counter,
    git::{GitError, GitGuard},
    job::{JobSpec, JobSpecBuilder, RunIdentity},
    overrides::{self, ConfigSchema, InvalidOverrideError, OverrideSet},
    resources::{ResourceArityError, ResourceRequest},
    tracker::{RunTracker, TrackerError},
};
use std::{collections::BTreeSet, rc::Rc};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
mod dispatch_test;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Batch is invalid: {0}")]
    InvalidBatch(&'static str),
    #[error(transparent)]
    InvalidOverride(#[from] InvalidOverrideError),
    #[error(transparent)]
    ResourceArity(#[from] ResourceArityError),
    #[error("Tracker unavailable, refusing to submit without duplicate detection: {0}")]
    TrackerUnavailable(#[from] TrackerError),
    #[error(transparent)]
    Git(#[from] GitError),
}

/// Everything needed to dispatch one batch of runs
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentBatch {
    pub experiment_name: String,
    pub base_config: String,
    pub overrides: Vec<OverrideSet>,
    pub resources: ResourceRequest,
    pub dry_run: bool,
    pub skip_git_checks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// already running or finished according to the tracker
    SkippedDuplicate,
    /// the same overrides appear earlier in the batch
    SkippedRepeat,
    /// dry run, nothing was handed to the backend
    Simulated { command: Vec<String> },
    Submitted { job_id: String },
    SubmitFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    pub run: RunIdentity,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: u64,
    pub submitted: u64,
    pub simulated: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// one entry per override set, in batch order
    pub results: Vec<DispatchResult>,
    /// jobs that were built, i.e. not skipped as duplicates
    pub jobs: Vec<JobSpec>,
    pub summary: Summary,
}

impl DispatchReport {
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }
}

/// dispatch -> {submitted, simulated, failed, skipped}
struct OutcomeCounters {
    root: Rc<Counter>,
    submitted: Rc<Counter>,
    simulated: Rc<Counter>,
    failed: Rc<Counter>,
    skipped: Rc<Counter>,
}

impl OutcomeCounters {
    fn new() -> Self {
        let root = Counter::root("dispatch");

        Self {
            submitted: root.child("submitted"),
            simulated: root.child("simulated"),
            failed: root.child("failed"),
            skipped: root.child("skipped"),
            root,
        }
    }

    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::SkippedDuplicate | Outcome::SkippedRepeat => &self.skipped,
            Outcome::Simulated { .. } => &self.simulated,
            Outcome::Submitted { .. } => &self.submitted,
            Outcome::SubmitFailed { .. } => &self.failed,
        };

        counter.increment(1);
    }

    fn summary(&self) -> Summary {
        Summary {
            total: self.root.count(),
            submitted: self.submitted.count(),
            simulated: self.simulated.count(),
            failed: self.failed.count(),
            skipped: self.skipped.count(),
        }
    }
}

/// Per override set, either a duplicate or a job to dispatch
enum Planned {
    Duplicate(RunIdentity),
    Repeat(RunIdentity),
    Job,
}

/// Explicitly wired collaborators of a dispatch, see `Dispatcher::run`
pub struct Dispatcher<'a> {
    schema: &'a dyn ConfigSchema,
    tracker: &'a dyn RunTracker,
    backend: &'a dyn SubmitBackend,
    guard: &'a dyn GitGuard,
    entrypoint: Vec<String>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        schema: &'a dyn ConfigSchema,
        tracker: &'a dyn RunTracker,
        backend: &'a dyn SubmitBackend,
        guard: &'a dyn GitGuard,
        entrypoint: Vec<String>,
    ) -> Self {
        Self {
            schema,
            tracker,
            backend,
            guard,
            entrypoint,
        }
    }

    /// Validate, deduplicate and submit a batch.
    ///
    /// Every precondition (batch shape, overrides, gpu arity, tracker, git) is checked
    /// before the first job reaches the backend, so a failing precondition submits nothing.
    /// Once submission starts, a failing job only affects its own result.
    #[instrument(skip_all, fields(experiment = %batch.experiment_name, runs = batch.overrides.len(), dry_run = batch.dry_run))]
    pub fn run(&self, batch: &ExperimentBatch) -> Result<DispatchReport, DispatchError> {
        if batch.experiment_name.trim().is_empty() {
            return Err(DispatchError::InvalidBatch("experiment_name must not be empty"));
        }

        overrides::validate(&batch.overrides, self.schema)?;
        let resources = batch.resources.assign(batch.overrides.len())?;

        let existing = match self.tracker.running_finished_runs(&batch.experiment_name) {
            Ok(existing) => existing,
            Err(error) => {
                error!(error = ?error, "Failed to query the tracker for existing runs");

                return Err(error.into());
            }
        };
        debug!(existing = existing.len(), "Retrieved existing runs");

        let builder = JobSpecBuilder::new(
            self.entrypoint.clone(),
            batch.experiment_name.as_str(),
            batch.base_config.as_str(),
        );

        let mut seen = BTreeSet::new();
        let mut plan = Vec::with_capacity(batch.overrides.len());
        let mut jobs = Vec::new();

        for (overrides, resources) in batch.overrides.iter().zip(resources) {
            let run = builder.identity(overrides);

            if existing.contains(&run) {
                info!(run = %run, "Skipping run, it is already running or finished");
                plan.push(Planned::Duplicate(run));
            } else if !seen.insert(run.clone()) {
                warn!(run = %run, "Skipping run, the same overrides appear earlier in the batch");
                plan.push(Planned::Repeat(run));
            } else {
                plan.push(Planned::Job);
                jobs.push(builder.build(run, overrides, resources));
            }
        }

        self.check_git(batch)?;

        let counters = OutcomeCounters::new();
        let mut dispatched = self.dispatch(&jobs, batch.dry_run).into_iter();

        let results = plan
            .into_iter()
            .filter_map(|planned| match planned {
                Planned::Duplicate(run) => Some(DispatchResult {
                    run,
                    outcome: Outcome::SkippedDuplicate,
                }),
                Planned::Repeat(run) => Some(DispatchResult {
                    run,
                    outcome: Outcome::SkippedRepeat,
                }),
                // dispatch returns exactly one result per job, in order
                Planned::Job => dispatched.next(),
            })
            .inspect(|result| counters.record(&result.outcome))
            .collect();

        let summary = counters.summary();
        info!(
            total = summary.total,
            submitted = summary.submitted,
            simulated = summary.simulated,
            failed = summary.failed,
            skipped = summary.skipped,
            "Finished dispatch"
        );

        Ok(DispatchReport {
            results,
            jobs,
            summary,
        })
    }

    /// Real submissions require a clean tree unless skipped.
    /// A dry run only warns about what would block a real submission.
    fn check_git(&self, batch: &ExperimentBatch) -> Result<(), DispatchError> {
        match self.guard.check(batch.skip_git_checks) {
            Ok(_) => Ok(()),
            Err(error) if batch.dry_run => {
                warn!(error = %error, "Git check failed, a real submission would be refused");

                Ok(())
            }
            Err(error) => {
                error!(error = %error, "Refusing to submit");

                Err(error.into())
            }
        }
    }

    /// Hand every job to the backend, or only record it in a dry run.
    /// Jobs are independent, a failed submission does not stop the remaining ones.
    pub fn dispatch(&self, jobs: &[JobSpec], dry_run: bool) -> Vec<DispatchResult> {
        jobs.iter()
            .map(|job| {
                let outcome = if dry_run {
                    info!(run = %job.run, gpu = ?job.resources.gpu, command = ?job.command, "Would submit");

                    Outcome::Simulated {
                        command: job.command.clone(),
                    }
                } else {
                    match self.backend.submit(job) {
                        Ok(submitted) => Outcome::Submitted {
                            job_id: submitted.job_id,
                        },
                        Err(error) => {
                            error!(run = %job.run, error = %error, "Failed to submit");

                            Outcome::SubmitFailed {
                                reason: error.to_string(),
                            }
                        }
                    }
                };

                DispatchResult {
                    run: job.run.clone(),
                    outcome,
                }
            })
            .collect()
    }
}
