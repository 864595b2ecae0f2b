use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::broker::{ActivateJobsCommand, ActivatedJob, PartitionId};
use crate::config::LongPollingConfig;
use crate::error::{GatewayError, Result};
use crate::scheduler::sink::{Completion, Delivery, ResponseSink};
use crate::scheduler::timer::ScheduledTask;

pub type RequestId = u64;

/// Default activation lease handed to the broker.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound for a request timeout; larger values are clamped to it.
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// A client's request to activate jobs of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub max_jobs_to_activate: u32,
    /// Negative: sweep once and never block. Zero: use the gateway default.
    pub request_timeout_ms: i64,
    pub worker: String,
    /// How long activated jobs stay leased to the worker.
    pub job_timeout: Duration,
    /// Variables to fetch; empty fetches all of them.
    pub fetch_variables: Vec<String>,
}

impl ActivateJobsRequest {
    pub fn new(job_type: impl Into<String>, max_jobs_to_activate: u32) -> Self {
        Self {
            job_type: job_type.into(),
            max_jobs_to_activate,
            request_timeout_ms: 0,
            worker: "default".to_string(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            fetch_variables: Vec::new(),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout_ms: i64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_fetch_variables(mut self, fetch_variables: Vec<String>) -> Self {
        self.fetch_variables = fetch_variables;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(GatewayError::InvalidArgument(
                "job type must not be empty".to_string(),
            ));
        }
        if self.max_jobs_to_activate == 0 {
            return Err(GatewayError::InvalidArgument(
                "max jobs to activate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute deadline of the request, or `None` when it must not long poll.
    pub fn deadline(&self, now: Instant, config: &LongPollingConfig) -> Option<Instant> {
        if !config.enabled || self.request_timeout_ms < 0 {
            return None;
        }
        let timeout = if self.request_timeout_ms == 0 {
            config.timeout()
        } else {
            Duration::from_millis(self.request_timeout_ms as u64)
        };
        Some(now + timeout.min(MAX_REQUEST_TIMEOUT))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Sweeping partitions.
    Active,
    /// Parked until a notification, a probe or the deadline.
    Blocked,
    Completed,
    TimedOut,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::TimedOut | RequestState::Aborted
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Active => write!(f, "active"),
            RequestState::Blocked => write!(f, "blocked"),
            RequestState::Completed => write!(f, "completed"),
            RequestState::TimedOut => write!(f, "timed_out"),
            RequestState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Progress of one sweep over the partitions.
#[derive(Debug, Default)]
pub struct RoundProgress {
    pending: VecDeque<PartitionId>,
    awaiting: Option<PartitionId>,
    resource_exhausted: Option<String>,
    errors: Vec<String>,
}

impl RoundProgress {
    /// Start a sweep visiting `partitions` in ascending order.
    pub fn new(mut partitions: Vec<PartitionId>) -> Self {
        partitions.sort_unstable();
        partitions.dedup();
        Self {
            pending: partitions.into(),
            ..Self::default()
        }
    }

    /// Take the next partition to poll and mark it as awaited.
    pub fn next_partition(&mut self) -> Option<PartitionId> {
        let partition = self.pending.pop_front()?;
        self.awaiting = Some(partition);
        Some(partition)
    }

    /// Accept the response of `partition`. Returns false if that partition was not awaited.
    pub fn finish_partition(&mut self, partition: PartitionId) -> bool {
        if self.awaiting == Some(partition) {
            self.awaiting = None;
            true
        } else {
            false
        }
    }

    pub fn awaiting(&self) -> Option<PartitionId> {
        self.awaiting
    }

    pub fn record_exhausted(&mut self, message: String) {
        self.resource_exhausted.get_or_insert(message);
    }

    pub fn record_error(&mut self, partition: PartitionId, message: &str) {
        self.errors.push(format!("partition {partition}: {message}"));
    }

    pub fn resource_exhausted(&self) -> Option<&str> {
        self.resource_exhausted.as_deref()
    }

    pub fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}

/// State of one client request across its lifetime.
///
/// Owned by the scheduler loop. The terminal transitions finalize the sink exactly once and cancel
/// the deadline timer and the cancellation watcher.
pub struct InflightRequest {
    pub id: RequestId,
    pub job_type: String,
    pub max_jobs_to_activate: u32,
    pub worker: String,
    pub job_timeout: Duration,
    pub fetch_variables: Vec<String>,
    pub deadline: Option<Instant>,
    pub activated_count: u32,
    /// Set when jobs became available while this request was sweeping.
    pub dirty: bool,
    /// Set once the request was woken from the blocked set.
    pub retried: bool,
    pub round: RoundProgress,
    state: RequestState,
    timer: ScheduledTask,
    cancel_watch: ScheduledTask,
    sink: Box<dyn ResponseSink>,
}

impl std::fmt::Debug for InflightRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRequest")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("state", &self.state)
            .field("activated_count", &self.activated_count)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl InflightRequest {
    pub fn new(
        id: RequestId,
        request: ActivateJobsRequest,
        deadline: Option<Instant>,
        sink: Box<dyn ResponseSink>,
    ) -> Self {
        Self {
            id,
            job_type: request.job_type,
            max_jobs_to_activate: request.max_jobs_to_activate,
            worker: request.worker,
            job_timeout: request.job_timeout,
            fetch_variables: request.fetch_variables,
            deadline,
            activated_count: 0,
            dirty: false,
            retried: false,
            round: RoundProgress::default(),
            state: RequestState::Active,
            timer: ScheduledTask::default(),
            cancel_watch: ScheduledTask::default(),
            sink,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn set_active(&mut self) {
        if !self.is_terminal() {
            self.state = RequestState::Active;
        }
    }

    pub fn set_blocked(&mut self) {
        if !self.is_terminal() {
            self.state = RequestState::Blocked;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_jobs_to_activate
            .saturating_sub(self.activated_count)
    }

    /// Whether the request may block waiting for jobs.
    pub fn is_long_polling(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_timed_out_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn awaiting_partition(&self) -> Option<PartitionId> {
        self.round.awaiting()
    }

    /// Activation command for `partition_id`, asking for the remaining jobs.
    pub fn command(&self, partition_id: PartitionId) -> ActivateJobsCommand {
        ActivateJobsCommand {
            request_id: self.id,
            partition_id,
            job_type: self.job_type.clone(),
            max_jobs_to_activate: self.remaining(),
            worker: self.worker.clone(),
            job_timeout: self.job_timeout,
            fetch_variables: self.fetch_variables.clone(),
        }
    }

    /// Replace the deadline timer; the previous one is cancelled.
    pub fn set_timer(&mut self, timer: ScheduledTask) {
        self.timer = timer;
    }

    pub fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    pub fn watch_cancellation(&mut self, watch: ScheduledTask) {
        self.cancel_watch = watch;
    }

    /// Push a batch to the client, counting it on delivery.
    pub fn try_send(&mut self, jobs: &[ActivatedJob]) -> Result<Delivery> {
        let delivery = self.sink.try_send(jobs)?;
        if delivery == Delivery::Delivered {
            self.activated_count += jobs.len() as u32;
        }
        Ok(delivery)
    }

    pub fn complete(&mut self) -> bool {
        let completion = if self.activated_count > 0 {
            Completion::Activated
        } else {
            Completion::NoJobs
        };
        self.finish(RequestState::Completed, |sink| sink.complete(completion))
    }

    pub fn time_out(&mut self) -> bool {
        self.finish(RequestState::TimedOut, |sink| {
            sink.complete(Completion::TimedOut)
        })
    }

    pub fn abort(&mut self, error: GatewayError) -> bool {
        self.finish(RequestState::Aborted, |sink| sink.fail(error))
    }

    fn finish<F>(&mut self, state: RequestState, finalize: F) -> bool
    where
        F: FnOnce(&mut dyn ResponseSink),
    {
        if self.is_terminal() {
            return false;
        }
        self.state = state;
        self.timer.cancel();
        self.cancel_watch.cancel();
        finalize(self.sink.as_mut());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        batches: usize,
        completions: Vec<Completion>,
        failures: Vec<GatewayError>,
    }

    struct RecordingSink(Arc<Mutex<Recorded>>);

    impl ResponseSink for RecordingSink {
        fn try_send(&mut self, _jobs: &[ActivatedJob]) -> Result<Delivery> {
            self.0.lock().unwrap().batches += 1;
            Ok(Delivery::Delivered)
        }

        fn complete(&mut self, completion: Completion) {
            self.0.lock().unwrap().completions.push(completion);
        }

        fn fail(&mut self, error: GatewayError) {
            self.0.lock().unwrap().failures.push(error);
        }
    }

    fn inflight(max: u32) -> (InflightRequest, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let request = InflightRequest::new(
            1,
            ActivateJobsRequest::new("pay", max),
            None,
            Box::new(RecordingSink(recorded.clone())),
        );
        (request, recorded)
    }

    #[test]
    fn validate_rejects_empty_type_and_zero_max() {
        assert!(ActivateJobsRequest::new("pay", 1).validate().is_ok());
        assert!(matches!(
            ActivateJobsRequest::new("  ", 1).validate(),
            Err(GatewayError::InvalidArgument(_))
        ));
        assert!(matches!(
            ActivateJobsRequest::new("pay", 0).validate(),
            Err(GatewayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn deadline_follows_request_timeout() {
        let config = LongPollingConfig::default();
        let now = Instant::now();

        let fail_fast = ActivateJobsRequest::new("pay", 1).with_request_timeout(-1);
        assert_eq!(fail_fast.deadline(now, &config), None);

        let default = ActivateJobsRequest::new("pay", 1);
        assert_eq!(default.deadline(now, &config), Some(now + config.timeout()));

        let explicit = ActivateJobsRequest::new("pay", 1).with_request_timeout(250);
        assert_eq!(
            explicit.deadline(now, &config),
            Some(now + Duration::from_millis(250))
        );
    }

    #[test]
    fn disabled_long_polling_never_has_a_deadline() {
        let config = LongPollingConfig {
            enabled: false,
            ..LongPollingConfig::default()
        };
        let request = ActivateJobsRequest::new("pay", 1).with_request_timeout(5_000);
        assert_eq!(request.deadline(Instant::now(), &config), None);
    }

    #[test]
    fn round_visits_partitions_in_ascending_order() {
        let mut round = RoundProgress::new(vec![3, 1, 2, 1]);
        assert_eq!(round.next_partition(), Some(1));
        assert!(!round.finish_partition(2));
        assert!(round.finish_partition(1));
        assert_eq!(round.next_partition(), Some(2));
        assert_eq!(round.next_partition(), Some(3));
        assert_eq!(round.next_partition(), None);
    }

    #[test]
    fn round_keeps_first_exhaustion_message() {
        let mut round = RoundProgress::new(vec![1, 2]);
        round.record_exhausted("first".to_string());
        round.record_exhausted("second".to_string());
        assert_eq!(round.resource_exhausted(), Some("first"));
    }

    #[test]
    fn delivered_batches_count_towards_max() {
        let (mut request, _) = inflight(5);
        let job = ActivatedJob {
            key: 1,
            job_type: "pay".to_string(),
            partition_id: 1,
            retries: 3,
            worker: "w".to_string(),
            deadline: chrono::Utc::now(),
            variables: "{}".to_string(),
        };
        request.try_send(&[job.clone(), job]).unwrap();
        assert_eq!(request.activated_count, 2);
        assert_eq!(request.remaining(), 3);
        assert_eq!(request.command(4).max_jobs_to_activate, 3);
    }

    #[test]
    fn terminal_transition_happens_once() {
        let (mut request, recorded) = inflight(1);
        assert!(request.time_out());
        assert!(!request.complete());
        assert!(!request.abort(GatewayError::Canceled));
        assert_eq!(request.state(), RequestState::TimedOut);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.completions, vec![Completion::TimedOut]);
        assert!(recorded.failures.is_empty());
    }

    #[test]
    fn state_cannot_leave_terminal() {
        let (mut request, _) = inflight(1);
        request.abort(GatewayError::Canceled);
        request.set_blocked();
        request.set_active();
        assert_eq!(request.state(), RequestState::Aborted);
    }
}
