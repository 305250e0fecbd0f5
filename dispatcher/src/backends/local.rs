use super::{SubmitBackend, SubmitError, SubmitOutcome};
use crate::job::JobSpec;
use std::{
    fs::{self, File},
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::info;

/// Starts each job as a detached process on this machine
#[derive(Debug, Clone)]
pub struct LocalBackend {
    log_dir: Option<PathBuf>,
}

impl LocalBackend {
    pub fn new(log_dir: Option<PathBuf>) -> Self {
        Self { log_dir }
    }

    fn output(&self, job: &JobSpec) -> Result<(Stdio, Stdio), SubmitError> {
        match &self.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(SubmitError::LogFile)?;
                let file = File::create(dir.join(format!("{}.log", job.run)))
                    .map_err(SubmitError::LogFile)?;
                let stderr = file.try_clone().map_err(SubmitError::LogFile)?;

                Ok((Stdio::from(file), Stdio::from(stderr)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

impl SubmitBackend for LocalBackend {
    fn submit(&self, job: &JobSpec) -> Result<SubmitOutcome, SubmitError> {
        let (program, arguments) = job.command.split_first().ok_or(SubmitError::EmptyCommand)?;
        let (stdout, stderr) = self.output(job)?;

        let mut command = Command::new(program);
        command
            .args(arguments)
            .env("SWEEP_RUN_NAME", job.run.as_str())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        if let Some(gpu) = job.resources.gpu {
            command.env("CUDA_VISIBLE_DEVICES", gpu.to_string());
        }

        // the child is intentionally not waited on, it outlives the dispatch
        let child = command.spawn().map_err(|source| SubmitError::Spawn {
            program: program.clone(),
            source,
        })?;
        let job_id = child.id().to_string();

        info!(run = %job.run, pid = job_id, "Started local job");

        Ok(SubmitOutcome { job_id })
    }
}
