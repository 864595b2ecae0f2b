//! Broker-facing side of the gateway.
//!
//! - [`PartitionClient`]: sends activation and fail commands to individual partitions
//! - [`InMemoryBroker`]: in-process partitions used by the simulator and the test suite
//! - [`job`]: activated jobs and the commands exchanged with partitions

pub mod client;
pub mod job;
pub mod memory;

pub use client::PartitionClient;
pub use job::{
    ActivateJobsCommand, ActivatedJob, ActivationOutcome, FailJobCommand, JobKey, PartitionId,
    RejectionType,
};
pub use memory::InMemoryBroker;
