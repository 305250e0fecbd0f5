use crate::{
    dispatch::ExperimentBatch,
    overrides::OverrideSet,
    resources::{Cluster, ResourceRequest},
    tracker::fixed::RunStateMap,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read {0:?}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Entrypoint must contain at least the program to run")]
    EmptyEntrypoint,
}

/// Settings shared by all batches: where the schema lives, how jobs are started,
/// which tracker and which backend to use
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    /// fully resolved experiment config, its leaves are the legal override paths
    pub schema: PathBuf,
    /// program and leading arguments of every job
    pub entrypoint: Vec<String>,
    /// working tree checked before real submissions
    #[serde(default = "default_repository")]
    pub repository: PathBuf,
    pub tracker: TrackerConfig,
    pub backend: BackendConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum TrackerConfig {
    Sqlite {
        #[serde(default = "default_database_path")]
        path: PathBuf,
    },
    Static {
        #[serde(default)]
        runs: RunStateMap,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum BackendConfig {
    Slurm {
        #[serde(default = "default_sbatch")]
        sbatch: PathBuf,
        /// cluster -> slurm partition, clusters not listed use their own name
        #[serde(default)]
        partitions: BTreeMap<Cluster, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        extra_args: Vec<String>,
    },
    Local {
        #[serde(default)]
        log_dir: Option<PathBuf>,
    },
}

/// On-disk form of a batch
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchFile {
    pub experiment_name: String,
    #[serde(alias = "hydra_config")]
    pub base_config: String,
    pub memory: String,
    #[serde(default)]
    pub cluster: Cluster,
    #[serde(default)]
    pub gpu: Option<Vec<u32>>,
    #[serde(alias = "override_args_list")]
    pub overrides: Vec<OverrideSet>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_git_checks: bool,
}

fn read(path: &Path) -> Result<String, ConfigErrors> {
    fs::read_to_string(path).map_err(|error| ConfigErrors::Io(path.to_owned(), error))
}

/// resolve `path` relative to the directory containing the config file
fn relative_to(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        if let Some(parent) = base.parent() {
            *path = parent.join(&*path);
        }
    }
}

impl DispatcherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let mut config: Self = read(path)?.parse()?;

        relative_to(path, &mut config.schema);
        relative_to(path, &mut config.repository);
        if let TrackerConfig::Sqlite { path: database } = &mut config.tracker {
            relative_to(path, database);
        }
        if let BackendConfig::Local { log_dir: Some(dir) } = &mut config.backend {
            relative_to(path, dir);
        }

        debug!(path = ?path, config = ?config, "Loaded dispatcher config");

        Ok(config)
    }
}

impl FromStr for DispatcherConfig {
    type Err = ConfigErrors;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = serde_yaml::from_str(s)?;

        if config.entrypoint.is_empty() {
            return Err(ConfigErrors::EmptyEntrypoint);
        }

        Ok(config)
    }
}

impl BatchFile {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(&read(path)?)?)
    }

    pub fn into_batch(self) -> ExperimentBatch {
        ExperimentBatch {
            experiment_name: self.experiment_name,
            base_config: self.base_config,
            overrides: self.overrides,
            resources: ResourceRequest {
                memory: self.memory,
                cluster: self.cluster,
                gpu: self.gpu,
            },
            dry_run: self.dry_run,
            skip_git_checks: self.skip_git_checks,
        }
    }
}

fn default_repository() -> PathBuf {
    PathBuf::from(".")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sweep.db")
}

fn default_sbatch() -> PathBuf {
    PathBuf::from("sbatch")
}
