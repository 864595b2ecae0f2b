use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::broker::client::PartitionClient;
use crate::broker::job::{
    ActivateJobsCommand, ActivatedJob, ActivationOutcome, FailJobCommand, JobKey, PartitionId,
};
use crate::error::{GatewayError, Result};

const DEFAULT_RETRIES: i32 = 3;

/// Overrides the outcome of an activation attempt. Returning `None` falls through to the
/// in-memory queues.
pub type ActivationHook = Box<dyn FnMut(&ActivateJobsCommand) -> Option<ActivationOutcome> + Send>;

#[derive(Debug, Clone)]
struct QueuedJob {
    key: JobKey,
    retries: i32,
    variables: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// Activatable jobs per partition and job type, in activation order.
    available: HashMap<(PartitionId, String), VecDeque<QueuedJob>>,
    /// Jobs handed out to a worker, kept so they can be made activatable again.
    activated: HashMap<JobKey, (String, QueuedJob)>,
    activations: Vec<ActivateJobsCommand>,
    failures: Vec<FailJobCommand>,
    next_key: JobKey,
}

/// Partition client backed by in-process queues.
///
/// Used by the simulation binary and by tests; every activation and fail command is recorded so
/// callers can assert on the traffic the scheduler produced.
pub struct InMemoryBroker {
    partitions: Vec<PartitionId>,
    latency: Duration,
    state: Mutex<BrokerState>,
    hook: Mutex<Option<ActivationHook>>,
}

impl InMemoryBroker {
    /// Create a broker with partitions `1..=partition_count`.
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (1..=partition_count).collect(),
            latency: Duration::ZERO,
            state: Mutex::new(BrokerState {
                next_key: 1,
                ..BrokerState::default()
            }),
            hook: Mutex::new(None),
        }
    }

    /// Delay every activation attempt by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_activation_hook(&self, hook: ActivationHook) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn clear_activation_hook(&self) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Make `count` jobs of `job_type` activatable on `partition_id`.
    pub fn add_jobs(&self, partition_id: PartitionId, job_type: &str, count: usize) -> Vec<JobKey> {
        (0..count)
            .map(|_| self.add_job_with_variables(partition_id, job_type, "{}"))
            .collect()
    }

    pub fn add_job_with_variables(
        &self,
        partition_id: PartitionId,
        job_type: &str,
        variables: &str,
    ) -> JobKey {
        let mut state = self.state();
        let key = state.next_key;
        state.next_key += 1;
        state
            .available
            .entry((partition_id, job_type.to_string()))
            .or_default()
            .push_back(QueuedJob {
                key,
                retries: DEFAULT_RETRIES,
                variables: variables.to_string(),
            });
        key
    }

    /// Activatable jobs of `job_type` across all partitions.
    pub fn available_jobs(&self, job_type: &str) -> usize {
        self.state()
            .available
            .iter()
            .filter(|((_, t), _)| t == job_type)
            .map(|(_, queue)| queue.len())
            .sum()
    }

    /// Number of activation attempts received so far.
    pub fn activation_count(&self) -> usize {
        self.state().activations.len()
    }

    /// Activation attempts issued on behalf of one request.
    pub fn activations_for(&self, request_id: u64) -> usize {
        self.state()
            .activations
            .iter()
            .filter(|c| c.request_id == request_id)
            .count()
    }

    pub fn activations(&self) -> Vec<ActivateJobsCommand> {
        self.state().activations.clone()
    }

    /// Fail commands received so far, in arrival order.
    pub fn failed_jobs(&self) -> Vec<FailJobCommand> {
        self.state().failures.clone()
    }

    fn take_jobs(&self, command: &ActivateJobsCommand) -> Vec<ActivatedJob> {
        let mut state = self.state();
        let queued: Vec<QueuedJob> = match state
            .available
            .get_mut(&(command.partition_id, command.job_type.clone()))
        {
            Some(queue) => {
                let n = queue.len().min(command.max_jobs_to_activate as usize);
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        };

        let lease = chrono::Duration::from_std(command.job_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = Utc::now() + lease;

        queued
            .into_iter()
            .map(|job| {
                let activated = ActivatedJob {
                    key: job.key,
                    job_type: command.job_type.clone(),
                    partition_id: command.partition_id,
                    retries: job.retries,
                    worker: command.worker.clone(),
                    deadline,
                    variables: job.variables.clone(),
                };
                state
                    .activated
                    .insert(job.key, (command.job_type.clone(), job));
                activated
            })
            .collect()
    }
}

#[async_trait]
impl PartitionClient for InMemoryBroker {
    fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.clone()
    }

    async fn activate_jobs(&self, command: ActivateJobsCommand) -> ActivationOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.state().activations.push(command.clone());

        let overridden = {
            let mut hook = self.hook.lock().unwrap_or_else(PoisonError::into_inner);
            hook.as_mut().and_then(|hook| hook(&command))
        };
        if let Some(outcome) = overridden {
            return outcome;
        }

        if !self.partitions.contains(&command.partition_id) {
            return ActivationOutcome::Failed(format!(
                "partition {} does not exist",
                command.partition_id
            ));
        }

        let jobs = self.take_jobs(&command);
        if jobs.is_empty() {
            ActivationOutcome::Empty
        } else {
            ActivationOutcome::Jobs(jobs)
        }
    }

    async fn fail_job(&self, command: FailJobCommand) -> Result<()> {
        let mut state = self.state();
        state.failures.push(command.clone());

        let Some((job_type, mut job)) = state.activated.remove(&command.key) else {
            return Err(GatewayError::Broker(format!(
                "job {} is not activated",
                command.key
            )));
        };

        // Jobs without retries left would raise an incident instead of being re-activatable.
        if command.retries > 0 {
            job.retries = command.retries;
            state
                .available
                .entry((command.partition_id, job_type))
                .or_default()
                .push_front(job);
        }
        Ok(())
    }
}
