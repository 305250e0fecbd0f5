use std::{
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Working tree at {path:?} has uncommitted changes, commit or stash them first:\n{changes}")]
    DirtyRepo { path: PathBuf, changes: String },
    #[error("Failed to run git: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("git status failed in {path:?}: {stderr}")]
    StatusFailed { path: PathBuf, stderr: String },
}

/// Marker returned by a passing check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clean;

pub trait GitGuard {
    /// `skip` turns the check into a no-op that always reports clean
    fn check(&self, skip: bool) -> Result<Clean, GitError>;
}

/// Refuses submissions from a working tree with uncommitted or untracked changes
#[derive(Debug, Clone)]
pub struct GitStateGuard {
    repository: PathBuf,
}

impl GitStateGuard {
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
        }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }
}

impl GitGuard for GitStateGuard {
    fn check(&self, skip: bool) -> Result<Clean, GitError> {
        if skip {
            warn!("Skipping git checks, runs may not be reproducible");

            return Ok(Clean);
        }

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repository)
            .args(["status", "--porcelain"])
            .output()?;

        if !output.status.success() {
            return Err(GitError::StatusFailed {
                path: self.repository.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let changes = String::from_utf8_lossy(&output.stdout).trim_end().to_owned();

        if changes.is_empty() {
            debug!(path = ?self.repository, "Working tree is clean");

            Ok(Clean)
        } else {
            Err(GitError::DirtyRepo {
                path: self.repository.clone(),
                changes,
            })
        }
    }
}
