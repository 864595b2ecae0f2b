//! Long polling job activation.
//!
//! - [`LongPollingScheduler`]: single task that owns all requests, sweeps partitions and parks
//!   requests that found nothing
//! - [`SchedulerHandle`]: cloneable entry point used by the transport and by broker notifications
//! - [`registry`]: per job type bookkeeping (blocked requests, empty round counter, probe timer)
//! - [`sink`]: delivery of activated jobs back to the client

pub mod handle;
pub mod long_polling;
pub mod registry;
pub mod request;
mod round;
pub mod sink;
pub mod timer;

pub use handle::SchedulerHandle;
pub use long_polling::{LongPollingScheduler, SchedulerMessage};
pub use registry::{JobTypeStats, SchedulerStats};
pub use request::{ActivateJobsRequest, RequestId, RequestState};
pub use sink::{
    response_channel, ActivationEvent, ActivationResult, ActivationStream, ChannelSink,
    Completion, Delivery, ResponseSink,
};
