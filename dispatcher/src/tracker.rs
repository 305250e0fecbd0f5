pub mod fixed;
pub mod sqlite;

use crate::{config::TrackerConfig, job::RunIdentity};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::BTreeSet, fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("SQLite query failed: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("Unknown run state {0}")]
    UnknownState(String),
    #[error("Tracker {0} does not support recording run states")]
    ReadOnly(&'static str),
}

/// State of a run as seen by the tracker. Never changed by the dispatcher itself.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunState {
    Unknown = 0,
    Pending = 1,
    Running = 2,
    Finished = 3,
    Failed = 4,
}

impl RunState {
    /// runs in these states must not be submitted again
    pub fn blocks_resubmission(self) -> bool {
        matches!(self, Self::Running | Self::Finished)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            _ => Err(TrackerError::UnknownState(s.to_owned())),
        }
    }
}

impl TryFrom<i64> for RunState {
    type Error = TrackerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Pending),
            2 => Ok(Self::Running),
            3 => Ok(Self::Finished),
            4 => Ok(Self::Failed),
            other => Err(TrackerError::UnknownState(other.to_string())),
        }
    }
}

/// External record of previously submitted runs
pub trait RunTracker {
    /// names of all runs of `experiment` that are running or finished
    fn running_finished_runs(&self, experiment: &str)
        -> Result<BTreeSet<RunIdentity>, TrackerError>;
}

/// All available tracker variants, selected by `TrackerConfig`
#[derive(Debug)]
pub enum Trackers {
    SQLite(sqlite::SqliteTracker),
    Static(fixed::StaticTracker),
}

impl Trackers {
    pub fn load(config: &TrackerConfig) -> Result<Self, TrackerError> {
        match config {
            TrackerConfig::Sqlite { path } => Ok(Self::SQLite(sqlite::SqliteTracker::open(path)?)),
            TrackerConfig::Static { runs } => {
                Ok(Self::Static(fixed::StaticTracker::new(runs.clone())))
            }
        }
    }

    /// every known run of `experiment` with its state
    pub fn runs(&self, experiment: &str) -> Result<BTreeMap<RunIdentity, RunState>, TrackerError> {
        match self {
            Self::SQLite(tracker) => tracker.runs(experiment),
            Self::Static(tracker) => Ok(tracker.runs(experiment)),
        }
    }

    pub fn record(
        &self,
        experiment: &str,
        run: &RunIdentity,
        state: RunState,
    ) -> Result<(), TrackerError> {
        match self {
            Self::SQLite(tracker) => tracker.record(experiment, run, state),
            Self::Static(_) => Err(TrackerError::ReadOnly("static")),
        }
    }
}

impl RunTracker for Trackers {
    fn running_finished_runs(
        &self,
        experiment: &str,
    ) -> Result<BTreeSet<RunIdentity>, TrackerError> {
        match self {
            Self::SQLite(tracker) => tracker.running_finished_runs(experiment),
            Self::Static(tracker) => tracker.running_finished_runs(experiment),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_and_finished_block() {
        assert!(RunState::Running.blocks_resubmission());
        assert!(RunState::Finished.blocks_resubmission());
        assert!(!RunState::Failed.blocks_resubmission());
        assert!(!RunState::Pending.blocks_resubmission());
        assert!(!RunState::Unknown.blocks_resubmission());
    }

    #[test]
    fn state_conversions() {
        for state in [
            RunState::Unknown,
            RunState::Pending,
            RunState::Running,
            RunState::Finished,
            RunState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
            assert_eq!(RunState::try_from(state as i64).unwrap(), state);
        }

        assert!("crashed".parse::<RunState>().is_err());
        assert!(RunState::try_from(9_i64).is_err());
    }

    #[test]
    fn static_tracker_is_read_only() {
        let tracker = Trackers::load(&TrackerConfig::Static {
            runs: BTreeMap::new(),
        })
        .unwrap();

        assert!(matches!(
            tracker.record("exp", &RunIdentity::from("exp-1"), RunState::Running),
            Err(TrackerError::ReadOnly(_))
        ));
    }
}
