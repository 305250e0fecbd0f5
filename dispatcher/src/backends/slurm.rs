use super::{run_with_timeout, shell_quote, SubmitBackend, SubmitError, SubmitOutcome};
use crate::{job::JobSpec, resources::Cluster};
use itertools::Itertools;
use std::{collections::BTreeMap, path::PathBuf, process::Command, time::Duration};
use tracing::{debug, info};

/// Submits every job as a single `sbatch --wrap` call
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    sbatch: PathBuf,
    partitions: BTreeMap<Cluster, String>,
    timeout: Option<Duration>,
    extra_args: Vec<String>,
}

impl SlurmBackend {
    pub fn new(
        sbatch: PathBuf,
        partitions: BTreeMap<Cluster, String>,
        timeout: Option<Duration>,
        extra_args: Vec<String>,
    ) -> Self {
        Self {
            sbatch,
            partitions,
            timeout,
            extra_args,
        }
    }

    /// partition for a cluster, falls back to the cluster name
    fn partition(&self, cluster: Cluster) -> &str {
        self.partitions
            .get(&cluster)
            .map(String::as_str)
            .unwrap_or(cluster.as_str())
    }

    /// sbatch arguments for a job
    pub fn arguments(&self, job: &JobSpec) -> Vec<String> {
        let mut arguments = vec![
            "--parsable".to_owned(),
            format!("--job-name={}", job.run),
            format!("--mem={}", job.resources.memory),
            format!("--partition={}", self.partition(job.cluster())),
        ];

        // a gres allocation renumbers devices from 0, so a pinned index only
        // makes sense without one
        match job.resources.gpu {
            Some(gpu) => arguments.push(format!("--export=ALL,CUDA_VISIBLE_DEVICES={gpu}")),
            None => arguments.push("--gres=gpu:1".to_owned()),
        }

        arguments.extend(self.extra_args.iter().cloned());
        arguments.push(format!(
            "--wrap={}",
            job.command.iter().map(|argument| shell_quote(argument)).join(" ")
        ));

        arguments
    }
}

/// Accepts both `--parsable` output (`<id>[;<cluster>]`) and the default
/// `Submitted batch job <id>` line
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;

    let id = match line.strip_prefix("Submitted batch job") {
        Some(rest) => rest.trim(),
        None => line.split(';').next().unwrap_or(line).trim(),
    };

    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(id.to_owned())
    } else {
        None
    }
}

impl SubmitBackend for SlurmBackend {
    fn submit(&self, job: &JobSpec) -> Result<SubmitOutcome, SubmitError> {
        if job.command.is_empty() {
            return Err(SubmitError::EmptyCommand);
        }

        let arguments = self.arguments(job);
        debug!(run = %job.run, arguments = ?arguments, "Calling sbatch");

        let output = run_with_timeout(Command::new(&self.sbatch).args(&arguments), self.timeout)?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            return Err(SubmitError::Rejected {
                program: self.sbatch.to_string_lossy().into_owned(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        match parse_job_id(&stdout) {
            Some(job_id) => {
                info!(run = %job.run, job_id = job_id, "Submitted to slurm");

                Ok(SubmitOutcome { job_id })
            }
            None => Err(SubmitError::UnparsableOutput(stdout.into_owned())),
        }
    }
}
