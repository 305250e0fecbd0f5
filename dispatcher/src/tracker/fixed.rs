use super::{RunState, RunTracker, TrackerError};
use crate::job::RunIdentity;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// experiment -> run -> state
pub type RunStateMap = BTreeMap<String, BTreeMap<RunIdentity, RunState>>;

/// Tracker with a fixed set of known runs, for environments without access to a
/// tracking service
#[derive(Debug, Clone, Default)]
pub struct StaticTracker {
    runs: RunStateMap,
}

impl StaticTracker {
    pub fn new(runs: RunStateMap) -> Self {
        Self { runs }
    }

    pub fn runs(&self, experiment: &str) -> BTreeMap<RunIdentity, RunState> {
        self.runs.get(experiment).cloned().unwrap_or_default()
    }
}

impl RunTracker for StaticTracker {
    fn running_finished_runs(
        &self,
        experiment: &str,
    ) -> Result<BTreeSet<RunIdentity>, TrackerError> {
        let existing: BTreeSet<RunIdentity> = self
            .runs
            .get(experiment)
            .into_iter()
            .flatten()
            .filter(|(_, state)| state.blocks_resubmission())
            .map(|(run, _)| run.clone())
            .collect();

        debug!(experiment = experiment, existing = existing.len(), "Static tracker lookup");

        Ok(existing)
    }
}
