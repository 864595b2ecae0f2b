use async_trait::async_trait;

use crate::broker::job::{ActivateJobsCommand, ActivationOutcome, FailJobCommand, PartitionId};
use crate::error::Result;

/// Client side of the broker partitions.
///
/// The scheduler never awaits these calls on its own loop; each call runs on a spawned task and
/// its result is fed back to the scheduler as a message.
#[async_trait]
pub trait PartitionClient: Send + Sync + 'static {
    /// Partitions to sweep, in the order they are visited.
    fn partition_ids(&self) -> Vec<PartitionId>;

    /// Try to activate up to `command.max_jobs_to_activate` jobs on one partition.
    async fn activate_jobs(&self, command: ActivateJobsCommand) -> ActivationOutcome;

    /// Fail a job on its owning partition.
    async fn fail_job(&self, command: FailJobCommand) -> Result<()>;
}
