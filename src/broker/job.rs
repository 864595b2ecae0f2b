use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PartitionId = u32;
pub type JobKey = i64;

/// Fixed per-job framing cost used when estimating the size of a response batch.
const JOB_ENVELOPE_BYTES: usize = 64;

/// A job that a partition has activated on behalf of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedJob {
    pub key: JobKey,
    pub job_type: String,
    /// Partition that owns the job; releases are routed back to it.
    pub partition_id: PartitionId,
    pub retries: i32,
    pub worker: String,
    /// Activation lease; the broker times the job out after this instant.
    pub deadline: DateTime<Utc>,
    /// JSON document with the job variables.
    pub variables: String,
}

impl ActivatedJob {
    /// Approximate number of bytes this job occupies in a response.
    pub fn encoded_len(&self) -> usize {
        JOB_ENVELOPE_BYTES + self.job_type.len() + self.worker.len() + self.variables.len()
    }
}

/// One activation attempt against a single partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateJobsCommand {
    pub request_id: u64,
    pub partition_id: PartitionId,
    pub job_type: String,
    pub max_jobs_to_activate: u32,
    pub worker: String,
    pub job_timeout: Duration,
    pub fetch_variables: Vec<String>,
}

/// Fail command used to hand an activated job back to its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailJobCommand {
    pub key: JobKey,
    pub partition_id: PartitionId,
    pub retries: i32,
    pub retry_backoff: Duration,
    pub error_message: String,
}

impl FailJobCommand {
    /// Release a job so any worker can activate it again right away.
    pub fn release(job: &ActivatedJob, error_message: impl Into<String>) -> Self {
        Self {
            key: job.key,
            partition_id: job.partition_id,
            retries: job.retries,
            retry_backoff: Duration::ZERO,
            error_message: error_message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionType {
    InvalidArgument,
    NotFound,
    InvalidState,
    ProcessingError,
}

impl std::fmt::Display for RejectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionType::InvalidArgument => write!(f, "invalid argument"),
            RejectionType::NotFound => write!(f, "not found"),
            RejectionType::InvalidState => write!(f, "invalid state"),
            RejectionType::ProcessingError => write!(f, "processing error"),
        }
    }
}

/// Result of one activation attempt against one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    Jobs(Vec<ActivatedJob>),
    Empty,
    /// The partition applied backpressure.
    ResourceExhausted(String),
    /// The partition refused the command for a business reason.
    Rejected {
        rejection_type: RejectionType,
        reason: String,
    },
    /// Transport or internal failure talking to the partition.
    Failed(String),
}

impl std::fmt::Display for ActivationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationOutcome::Jobs(jobs) => write!(f, "jobs({})", jobs.len()),
            ActivationOutcome::Empty => write!(f, "empty"),
            ActivationOutcome::ResourceExhausted(_) => write!(f, "resource_exhausted"),
            ActivationOutcome::Rejected { rejection_type, .. } => {
                write!(f, "rejected({})", rejection_type)
            }
            ActivationOutcome::Failed(_) => write!(f, "failed"),
        }
    }
}
