pub mod local;
pub mod slurm;

use crate::{config::BackendConfig, job::JobSpec};
use std::{
    io::{self, Read},
    process::{Command, Output, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not return within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Rejected {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Unable to read a job id from {0:?}")]
    UnparsableOutput(String),
    #[error("Job has an empty command")]
    EmptyCommand,
    #[error("Failed to open log file: {0}")]
    LogFile(std::io::Error),
}

/// Identifier assigned to a job by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: String,
}

/// Hands a single job over to a cluster (or the local machine)
pub trait SubmitBackend {
    fn submit(&self, job: &JobSpec) -> Result<SubmitOutcome, SubmitError>;
}

#[derive(Debug)]
pub enum Backends {
    Slurm(slurm::SlurmBackend),
    Local(local::LocalBackend),
}

impl Backends {
    pub fn load(config: &BackendConfig) -> Self {
        match config {
            BackendConfig::Slurm {
                sbatch,
                partitions,
                timeout_secs,
                extra_args,
            } => Self::Slurm(slurm::SlurmBackend::new(
                sbatch.clone(),
                partitions.clone(),
                timeout_secs.map(Duration::from_secs),
                extra_args.clone(),
            )),
            BackendConfig::Local { log_dir } => Self::Local(local::LocalBackend::new(log_dir.clone())),
        }
    }
}

impl SubmitBackend for Backends {
    fn submit(&self, job: &JobSpec) -> Result<SubmitOutcome, SubmitError> {
        match self {
            Self::Slurm(backend) => backend.submit(job),
            Self::Local(backend) => backend.submit(job),
        }
    }
}

/// Quote a single argument for a POSIX shell
pub fn shell_quote(argument: &str) -> String {
    let is_plain = !argument.is_empty()
        && argument
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@=+,%".contains(c));

    if is_plain {
        argument.to_owned()
    } else {
        format!("'{}'", argument.replace('\'', r"'\''"))
    }
}

/// Read a child pipe to the end on its own thread, so a chatty child cannot
/// block on a full pipe while we wait for it
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(program: &str, reader: JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>, SubmitError> {
    reader
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "pipe reader panicked")))
        .map_err(|source| SubmitError::Wait {
            program: program.to_owned(),
            source,
        })
}

/// Run a command to completion, killing it once `timeout` is exceeded
pub(crate) fn run_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
) -> Result<Output, SubmitError> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| SubmitError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match timeout {
        Some(timeout) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                if let Err(error) = child.kill() {
                    warn!(error = ?error, "Failed to kill {program} after timeout");
                }
                // reap the killed child, the readers are left to finish on their own
                let _ = child.wait();

                return Err(SubmitError::Timeout { program, timeout });
            }
            Err(source) => return Err(SubmitError::Wait { program, source }),
        },
        None => child.wait().map_err(|source| SubmitError::Wait {
            program: program.clone(),
            source,
        })?,
    };

    let stdout = collect(&program, stdout)?;
    let stderr = collect(&program, stderr)?;

    debug!(program = program, status = ?status, "Submission command returned");

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}
