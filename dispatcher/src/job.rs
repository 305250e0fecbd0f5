use crate::{
    overrides::OverrideSet,
    resources::{Cluster, RunResources},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// number of hex characters of the override digest kept in a run name
const DIGEST_LENGTH: usize = 12;

/// Deterministic name of a run, shared with the tracker for deduplication
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RunIdentity(String);

impl RunIdentity {
    /// `<experiment>-<digest>` where the digest covers the base config and the overrides
    pub fn derive(experiment_name: &str, base_config: &str, overrides: &OverrideSet) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(base_config.as_bytes());
        hasher.update(b"\n");

        for argument in overrides.to_args() {
            hasher.update(argument.as_bytes());
            hasher.update(b"\n");
        }

        let digest = hex::encode(hasher.finalize());

        Self(format!("{experiment_name}-{}", &digest[..DIGEST_LENGTH]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A fully resolved job, ready to be handed to a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub run: RunIdentity,
    pub command: Vec<String>,
    pub resources: RunResources,
}

impl JobSpec {
    pub fn cluster(&self) -> Cluster {
        self.resources.cluster
    }
}

#[derive(Clone, Debug)]
pub struct JobSpecBuilder {
    entrypoint: Vec<String>,
    experiment_name: String,
    base_config: String,
}

impl JobSpecBuilder {
    pub fn new(
        entrypoint: Vec<String>,
        experiment_name: impl Into<String>,
        base_config: impl Into<String>,
    ) -> Self {
        Self {
            entrypoint,
            experiment_name: experiment_name.into(),
            base_config: base_config.into(),
        }
    }

    pub fn identity(&self, overrides: &OverrideSet) -> RunIdentity {
        RunIdentity::derive(&self.experiment_name, &self.base_config, overrides)
    }

    /// Pure: the same inputs always give the same spec
    pub fn build(
        &self,
        run: RunIdentity,
        overrides: &OverrideSet,
        resources: RunResources,
    ) -> JobSpec {
        let mut command = self.entrypoint.clone();
        command.push(format!("+experiment={}", self.base_config));
        command.push(format!("experiment_name={}", self.experiment_name));
        command.push(format!("run_name={run}"));
        command.extend(overrides.to_args());

        JobSpec {
            run,
            command,
            resources,
        }
    }
}
