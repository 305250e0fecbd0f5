use super::{DispatchError, Dispatcher, ExperimentBatch, Outcome};
use crate::{
    backends::{SubmitBackend, SubmitError, SubmitOutcome},
    git::{Clean, GitError, GitGuard},
    job::{JobSpec, RunIdentity},
    overrides::{OverrideSet, YamlSchema, INVALID_OVERRIDES},
    resources::{Cluster, ResourceRequest},
    tracker::{RunTracker, TrackerError},
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, path::PathBuf};

const SCHEMA: &str = "
model:
  name_or_path: EleutherAI/pythia-14m
  revision: main
dataset:
  n_val: 100
";

#[derive(Default)]
struct RecordingTracker {
    existing: Mutex<BTreeSet<RunIdentity>>,
    queries: Mutex<Vec<String>>,
    unavailable: bool,
}

impl RunTracker for RecordingTracker {
    fn running_finished_runs(
        &self,
        experiment: &str,
    ) -> Result<BTreeSet<RunIdentity>, TrackerError> {
        self.queries.lock().push(experiment.to_owned());

        if self.unavailable {
            Err(TrackerError::UnknownState("tracker offline".to_owned()))
        } else {
            Ok(self.existing.lock().clone())
        }
    }
}

#[derive(Default)]
struct RecordingBackend {
    submitted: Mutex<Vec<JobSpec>>,
    reject: BTreeSet<RunIdentity>,
}

impl SubmitBackend for RecordingBackend {
    fn submit(&self, job: &JobSpec) -> Result<SubmitOutcome, SubmitError> {
        if self.reject.contains(&job.run) {
            return Err(SubmitError::UnparsableOutput("sbatch: error".to_owned()));
        }

        let mut submitted = self.submitted.lock();
        submitted.push(job.clone());

        Ok(SubmitOutcome {
            job_id: submitted.len().to_string(),
        })
    }
}

#[derive(Default)]
struct FakeGuard {
    dirty: bool,
    checks: Mutex<Vec<bool>>,
}

impl GitGuard for FakeGuard {
    fn check(&self, skip: bool) -> Result<Clean, GitError> {
        self.checks.lock().push(skip);

        if self.dirty && !skip {
            Err(GitError::DirtyRepo {
                path: PathBuf::from("."),
                changes: " M src/lib.rs".to_owned(),
            })
        } else {
            Ok(Clean)
        }
    }
}

fn schema() -> YamlSchema {
    YamlSchema::parse(SCHEMA).unwrap()
}

fn models(names: &[&str]) -> Vec<OverrideSet> {
    names
        .iter()
        .map(|name| [("model.name_or_path", *name)].into_iter().collect())
        .collect()
}

fn batch(overrides: Vec<OverrideSet>) -> ExperimentBatch {
    ExperimentBatch {
        experiment_name: "typo_example".to_owned(),
        base_config: "Eval/pm_gcg".to_owned(),
        overrides,
        resources: ResourceRequest::new("50G", Cluster::A6k),
        dry_run: false,
        skip_git_checks: true,
    }
}

fn entrypoint() -> Vec<String> {
    vec!["python".to_owned(), "-m".to_owned(), "robust_llm".to_owned()]
}

fn identity(batch: &ExperimentBatch, index: usize) -> RunIdentity {
    RunIdentity::derive(
        &batch.experiment_name,
        &batch.base_config,
        &batch.overrides[index],
    )
}

#[test]
pub fn typo_rejects_batch_without_submitting() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut overrides = models(&["a", "b"]);
    overrides.push([("model.name_or_path_OOPS_typo", "c")].into_iter().collect());

    let error = dispatcher.run(&batch(overrides)).unwrap_err();

    assert!(matches!(error, DispatchError::InvalidOverride(_)));
    assert_eq!(error.to_string(), INVALID_OVERRIDES);
    assert!(backend.submitted.lock().is_empty());
    assert!(tracker.queries.lock().is_empty());
}

#[test]
pub fn typo_rejected_in_dry_run() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(vec![[("model.name_or_path_OOPS_typo", "x")]
        .into_iter()
        .collect()]);
    batch.dry_run = true;

    assert_eq!(
        dispatcher.run(&batch).unwrap_err().to_string(),
        "override_args are invalid, aborting."
    );
}

#[test]
pub fn gpu_arity_checked_before_tracker() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&["X"]));
    batch.resources = ResourceRequest::new("50G", Cluster::H100).with_gpus(vec![1, 2]);
    batch.dry_run = true;

    assert!(matches!(
        dispatcher.run(&batch),
        Err(DispatchError::ResourceArity(error)) if error.gpus == 2 && error.runs == 1
    ));
    assert!(tracker.queries.lock().is_empty());
    assert!(backend.submitted.lock().is_empty());
}

#[test]
pub fn tracker_queried_once_per_dispatch() {
    for size in [1, 5] {
        let (schema, tracker, backend, guard) = (
            schema(),
            RecordingTracker::default(),
            RecordingBackend::default(),
            FakeGuard::default(),
        );
        let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

        let names: Vec<String> = (0..size).map(|index| format!("model-{index}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let report = dispatcher.run(&batch(models(&names))).unwrap();

        assert_eq!(*tracker.queries.lock(), vec!["typo_example".to_owned()]);
        assert_eq!(report.summary.submitted, size);
        assert_eq!(backend.submitted.lock().len() as u64, size);
    }
}

#[test]
pub fn dry_run_never_submits() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&["a", "b", "c"]));
    batch.dry_run = true;
    let report = dispatcher.run(&batch).unwrap();

    assert!(backend.submitted.lock().is_empty());
    assert_eq!(report.summary.simulated, 3);
    assert_eq!(report.jobs.len(), 3);
    assert!(report
        .results
        .iter()
        .zip(report.jobs.iter())
        .all(|(result, job)| result.outcome
            == Outcome::Simulated {
                command: job.command.clone()
            }));
}

#[test]
pub fn existing_run_is_skipped() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let batch = batch(models(&["a", "b", "c"]));
    tracker.existing.lock().insert(identity(&batch, 1));

    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());
    let report = dispatcher.run(&batch).unwrap();

    assert_eq!(report.results[1].outcome, Outcome::SkippedDuplicate);
    assert_eq!(report.results[1].run, identity(&batch, 1));
    assert!(matches!(report.results[0].outcome, Outcome::Submitted { .. }));
    assert!(matches!(report.results[2].outcome, Outcome::Submitted { .. }));
    assert_eq!(
        backend
            .submitted
            .lock()
            .iter()
            .map(|job| job.run.clone())
            .collect::<Vec<_>>(),
        vec![identity(&batch, 0), identity(&batch, 2)]
    );
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.total, 3);
}

#[test]
pub fn redispatch_after_completion_submits_nothing() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());
    let batch = batch(models(&["a", "b"]));

    let first = dispatcher.run(&batch).unwrap();
    assert_eq!(first.summary.submitted, 2);

    tracker
        .existing
        .lock()
        .extend(first.results.iter().map(|result| result.run.clone()));

    let second = dispatcher.run(&batch).unwrap();

    assert_eq!(second.summary.submitted, 0);
    assert_eq!(second.summary.skipped, 2);
    assert!(second.jobs.is_empty());
    assert_eq!(backend.submitted.lock().len(), 2);
}

#[test]
pub fn gpus_assigned_by_position() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&[
        "AlignmentResearch/robust_llm_pythia-tt-14m-mz-v0",
        "AlignmentResearch/robust_llm_pythia-wl-14m-niki-ada-v4-s-2",
    ]));
    batch.resources = ResourceRequest::new("50G", Cluster::H100).with_gpus(vec![1, 2]);
    batch.dry_run = true;

    let report = dispatcher.run(&batch).unwrap();

    assert_eq!(report.jobs.len(), 2);
    assert_eq!(report.jobs[0].run, identity(&batch, 0));
    assert_eq!(report.jobs[0].resources.gpu, Some(1));
    assert_eq!(report.jobs[1].run, identity(&batch, 1));
    assert_eq!(report.jobs[1].resources.gpu, Some(2));
    assert!(report.jobs.iter().all(|job| job.cluster() == Cluster::H100));
}

#[test]
pub fn submit_failure_is_isolated() {
    let batch = batch(models(&["a", "b", "c"]));
    let (schema, tracker, guard) = (schema(), RecordingTracker::default(), FakeGuard::default());
    let backend = RecordingBackend {
        reject: BTreeSet::from([identity(&batch, 0)]),
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let report = dispatcher.run(&batch).unwrap();

    assert!(matches!(
        report.results[0].outcome,
        Outcome::SubmitFailed { ref reason } if reason.contains("sbatch: error")
    ));
    assert!(matches!(report.results[1].outcome, Outcome::Submitted { .. }));
    assert!(matches!(report.results[2].outcome, Outcome::Submitted { .. }));
    assert!(report.has_failures());
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.submitted, 2);
}

#[test]
pub fn tracker_failure_aborts_batch() {
    let (schema, backend, guard) = (schema(), RecordingBackend::default(), FakeGuard::default());
    let tracker = RecordingTracker {
        unavailable: true,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    assert!(matches!(
        dispatcher.run(&batch(models(&["a", "b"]))),
        Err(DispatchError::TrackerUnavailable(_))
    ));
    assert!(backend.submitted.lock().is_empty());
    assert!(guard.checks.lock().is_empty());
}

#[test]
pub fn dirty_repo_blocks_real_submission() {
    let (schema, tracker, backend) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
    );
    let guard = FakeGuard {
        dirty: true,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&["a"]));
    batch.skip_git_checks = false;

    assert!(matches!(
        dispatcher.run(&batch),
        Err(DispatchError::Git(GitError::DirtyRepo { .. }))
    ));
    assert!(backend.submitted.lock().is_empty());

    batch.skip_git_checks = true;
    assert_eq!(dispatcher.run(&batch).unwrap().summary.submitted, 1);
    assert_eq!(*guard.checks.lock(), vec![false, true]);
}

#[test]
pub fn dirty_repo_only_warns_in_dry_run() {
    let (schema, tracker, backend) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
    );
    let guard = FakeGuard {
        dirty: true,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&["a"]));
    batch.skip_git_checks = false;
    batch.dry_run = true;

    assert_eq!(dispatcher.run(&batch).unwrap().summary.simulated, 1);
}

#[test]
pub fn repeated_overrides_submitted_once() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let report = dispatcher.run(&batch(models(&["a", "a"]))).unwrap();

    assert!(matches!(report.results[0].outcome, Outcome::Submitted { .. }));
    assert_eq!(report.results[1].outcome, Outcome::SkippedRepeat);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(backend.submitted.lock().len(), 1);
}

#[test]
pub fn empty_experiment_name_rejected() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let mut batch = batch(models(&["a"]));
    batch.experiment_name = "  ".to_owned();

    assert!(matches!(
        dispatcher.run(&batch),
        Err(DispatchError::InvalidBatch(_))
    ));
    assert!(tracker.queries.lock().is_empty());
}

#[test]
pub fn commands_carry_run_identity() {
    let (schema, tracker, backend, guard) = (
        schema(),
        RecordingTracker::default(),
        RecordingBackend::default(),
        FakeGuard::default(),
    );
    let dispatcher = Dispatcher::new(&schema, &tracker, &backend, &guard, entrypoint());

    let batch = batch(models(&["a"]));
    dispatcher.run(&batch).unwrap();

    let submitted = backend.submitted.lock();
    assert_eq!(
        submitted[0].command[3..],
        [
            "+experiment=Eval/pm_gcg".to_owned(),
            "experiment_name=typo_example".to_owned(),
            format!("run_name={}", identity(&batch, 0)),
            "model.name_or_path=a".to_owned(),
        ]
    );
    assert_eq!(submitted[0].resources.memory, "50G");
}
