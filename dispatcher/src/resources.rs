use serde::{Deserialize, Serialize};
use std::{fmt, iter, str::FromStr};
use thiserror::Error;

/// Clusters jobs can be submitted to
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Cluster {
    A6k,
    #[default]
    H100,
}

impl Cluster {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A6k => "a6k",
            Self::H100 => "h100",
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown cluster '{0}', expected one of: a6k, h100")]
pub struct UnknownCluster(pub String);

impl FromStr for Cluster {
    type Err = UnknownCluster;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "a6k" => Ok(Self::A6k),
            "h100" => Ok(Self::H100),
            _ => Err(UnknownCluster(s.to_owned())),
        }
    }
}

/// Resources requested for a whole batch
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    /// passed through to the backend as is, e.g. "50G"
    pub memory: String,
    pub cluster: Cluster,
    /// one GPU index per run, by position
    pub gpu: Option<Vec<u32>>,
}

/// Resources for a single run
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RunResources {
    pub memory: String,
    pub cluster: Cluster,
    pub gpu: Option<u32>,
}

/// The GPU list does not line up with the override sets.
/// This is a defect in how the batch was put together, not bad user data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gpu list has {gpus} entries but the batch has {runs} runs")]
pub struct ResourceArityError {
    pub gpus: usize,
    pub runs: usize,
}

impl ResourceRequest {
    pub fn new(memory: impl Into<String>, cluster: Cluster) -> Self {
        Self {
            memory: memory.into(),
            cluster,
            gpu: None,
        }
    }

    pub fn with_gpus(mut self, gpus: Vec<u32>) -> Self {
        self.gpu = Some(gpus);
        self
    }

    fn slice(&self, gpu: Option<u32>) -> RunResources {
        RunResources {
            memory: self.memory.clone(),
            cluster: self.cluster,
            gpu,
        }
    }

    /// Split the request into one slice per run
    pub fn assign(&self, runs: usize) -> Result<Vec<RunResources>, ResourceArityError> {
        match &self.gpu {
            None => Ok(iter::repeat_with(|| self.slice(None)).take(runs).collect()),
            Some(gpus) if gpus.len() == runs => {
                Ok(gpus.iter().map(|gpu| self.slice(Some(*gpu))).collect())
            }
            Some(gpus) => Err(ResourceArityError {
                gpus: gpus.len(),
                runs,
            }),
        }
    }
}
