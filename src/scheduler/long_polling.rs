use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::broker::{ActivationOutcome, PartitionClient, PartitionId};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::scheduler::handle::SchedulerHandle;
use crate::scheduler::registry::{JobTypeState, SchedulerStats};
use crate::scheduler::request::{ActivateJobsRequest, InflightRequest, RequestId, RequestState};
use crate::scheduler::sink::ResponseSink;
use crate::scheduler::timer::ScheduledTask;

/// Message types for the scheduler event loop
pub enum SchedulerMessage {
    /// New activation request from a client
    Activate {
        request_id: RequestId,
        request: ActivateJobsRequest,
        sink: Box<dyn ResponseSink>,
        /// Cancelled when the client goes away.
        cancel: Option<CancellationToken>,
    },
    /// Broker hint that jobs of a type may have become activatable
    JobsAvailable { job_type: String },
    /// Result of one activation attempt issued for a request
    PartitionResponse {
        request_id: RequestId,
        partition_id: PartitionId,
        outcome: ActivationOutcome,
    },
    /// Deadline timer of a blocked request fired
    DeadlineElapsed { request_id: RequestId },
    /// Recurring per-type probe
    Probe { job_type: String },
    /// Client cancelled the request
    Cancel { request_id: RequestId },
    /// Snapshot of the scheduler state
    Stats {
        response_tx: oneshot::Sender<SchedulerStats>,
    },
}

/// Long polling activation scheduler.
///
/// One task owns every request and every per-type registry. Partition calls, timers and client
/// cancellation run on their own tasks and report back through the message channel, so no
/// handler ever awaits and no state is shared.
pub struct LongPollingScheduler {
    pub(super) config: GatewayConfig,
    pub(super) client: Arc<dyn PartitionClient>,
    pub(super) requests: HashMap<RequestId, InflightRequest>,
    pub(super) job_types: HashMap<String, JobTypeState>,
    /// Weak so that timers and partition tasks do not keep the loop alive.
    pub(super) message_tx: mpsc::WeakSender<SchedulerMessage>,
}

impl LongPollingScheduler {
    pub fn new(
        config: GatewayConfig,
        client: Arc<dyn PartitionClient>,
    ) -> (Self, SchedulerHandle, mpsc::Receiver<SchedulerMessage>) {
        let (message_tx, message_rx) = mpsc::channel(config.channel_capacity.max(1));
        let handle = SchedulerHandle::new(message_tx.clone(), config.response_buffer);

        let scheduler = Self {
            config,
            client,
            requests: HashMap::new(),
            job_types: HashMap::new(),
            message_tx: message_tx.downgrade(),
        };

        (scheduler, handle, message_rx)
    }

    /// Validate `config` and run a scheduler on a new task.
    ///
    /// The task ends when `shutdown` is cancelled or every [`SchedulerHandle`] is dropped.
    pub fn spawn(
        config: GatewayConfig,
        client: Arc<dyn PartitionClient>,
        shutdown: CancellationToken,
    ) -> Result<(SchedulerHandle, JoinHandle<()>)> {
        config.validate()?;
        let (scheduler, handle, message_rx) = Self::new(config, client);
        let task = tokio::spawn(scheduler.run(message_rx, shutdown));
        Ok((handle, task))
    }

    /// Run the scheduler main loop
    pub async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<SchedulerMessage>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            partitions = self.client.partition_ids().len(),
            long_polling = self.config.long_polling.enabled,
            "Activation scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping activation scheduler");
                    break;
                }
                message = message_rx.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        tracing::debug!("All scheduler handles dropped");
                        break;
                    }
                },
            }
        }

        self.shutdown();
    }

    fn handle_message(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::Activate {
                request_id,
                request,
                sink,
                cancel,
            } => self.on_activate(request_id, request, sink, cancel),
            SchedulerMessage::JobsAvailable { job_type } => self.on_jobs_available(&job_type),
            SchedulerMessage::PartitionResponse {
                request_id,
                partition_id,
                outcome,
            } => self.on_partition_response(request_id, partition_id, outcome),
            SchedulerMessage::DeadlineElapsed { request_id } => self.on_deadline(request_id),
            SchedulerMessage::Probe { job_type } => self.on_probe(&job_type),
            SchedulerMessage::Cancel { request_id } => self.on_cancel(request_id),
            SchedulerMessage::Stats { response_tx } => {
                let _ = response_tx.send(self.stats());
            }
        }
    }

    /// Registry of `job_type`, created together with its probe timer on first use.
    pub(super) fn job_type_state(&mut self, job_type: &str) -> &mut JobTypeState {
        let long_polling = &self.config.long_polling;
        let message_tx = &self.message_tx;
        self.job_types
            .entry(job_type.to_string())
            .or_insert_with(|| {
                if !long_polling.enabled {
                    return JobTypeState::default();
                }
                let probe_type = job_type.to_string();
                JobTypeState::with_probe(ScheduledTask::every(
                    long_polling.probe_timeout(),
                    message_tx.clone(),
                    move || SchedulerMessage::Probe {
                        job_type: probe_type.clone(),
                    },
                ))
            })
    }

    fn on_activate(
        &mut self,
        request_id: RequestId,
        request: ActivateJobsRequest,
        mut sink: Box<dyn ResponseSink>,
        cancel: Option<CancellationToken>,
    ) {
        if let Err(e) = request.validate() {
            sink.fail(e);
            return;
        }

        let deadline = request.deadline(Instant::now(), &self.config.long_polling);
        let mut inflight = InflightRequest::new(request_id, request, deadline, sink);
        if let Some(token) = cancel {
            inflight.watch_cancellation(ScheduledTask::on_cancel(
                token,
                self.message_tx.clone(),
                SchedulerMessage::Cancel { request_id },
            ));
        }

        let job_type = inflight.job_type.clone();
        let long_polling = inflight.is_long_polling();
        self.requests.insert(request_id, inflight);

        let threshold = self.config.long_polling.min_empty_responses;
        let known_empty = self.job_type_state(&job_type).is_known_empty(threshold);

        tracing::debug!(
            request_id,
            job_type = %job_type,
            long_polling,
            known_empty,
            "Activation request received"
        );

        // Requests that cannot block always sweep once.
        if known_empty && long_polling {
            self.block(request_id);
        } else {
            self.start_round(request_id);
        }
    }

    fn on_jobs_available(&mut self, job_type: &str) {
        tracing::trace!(job_type, "Jobs available");
        self.wake(job_type, None, true);
    }

    /// Retry every blocked request of `job_type` in arrival order and flag sweeping ones so they
    /// poll again instead of blocking.
    pub(super) fn wake(&mut self, job_type: &str, except: Option<RequestId>, reset: bool) {
        let Some(state) = self.job_types.get_mut(job_type) else {
            return;
        };
        if reset {
            state.reset_empty_rounds();
        }
        let blocked = state.take_blocked();

        self.mark_dirty(job_type, except);
        for request_id in blocked {
            self.retry(request_id);
        }
    }

    /// Make every sweeping request of `job_type` poll again once its round ends empty.
    pub(super) fn mark_dirty(&mut self, job_type: &str, except: Option<RequestId>) {
        let Some(state) = self.job_types.get(job_type) else {
            return;
        };
        for request_id in state.active().filter(|id| Some(*id) != except) {
            if let Some(request) = self.requests.get_mut(&request_id) {
                request.dirty = true;
            }
        }
    }

    fn retry(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if request.state() != RequestState::Blocked {
            return;
        }
        request.retried = true;
        request.cancel_timer();
        tracing::trace!(request_id, "Retrying blocked request");
        self.start_round(request_id);
    }

    /// A retried request found jobs; peers may find more.
    pub(super) fn cascade(&mut self, job_type: &str, origin: RequestId) {
        self.wake(job_type, Some(origin), false);
    }

    fn on_deadline(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get(&request_id) else {
            return;
        };
        // A sweeping request checks its deadline when the round ends.
        if request.state() == RequestState::Blocked && request.is_timed_out_at(Instant::now()) {
            self.time_out(request_id);
        }
    }

    fn on_probe(&mut self, job_type: &str) {
        let blocked = match self.job_types.get(job_type) {
            Some(state) if state.has_blocked() => state.blocked_count(),
            _ => return,
        };
        tracing::debug!(job_type, blocked, "Probing blocked requests");
        self.wake(job_type, None, true);
    }

    fn on_cancel(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get(&request_id) else {
            return;
        };
        if request.is_terminal() {
            return;
        }
        tracing::debug!(request_id, state = %request.state(), "Activation request canceled");
        self.abort(request_id, GatewayError::Canceled);
    }

    pub(super) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            inflight_requests: self.requests.values().filter(|r| !r.is_terminal()).count(),
            job_types: self
                .job_types
                .iter()
                .map(|(job_type, state)| (job_type.clone(), state.stats()))
                .collect(),
        }
    }

    fn shutdown(&mut self) {
        for state in self.job_types.values_mut() {
            state.cancel_probe();
        }
        let pending: Vec<RequestId> = self.requests.keys().copied().collect();
        let aborted = pending.len();
        for request_id in pending {
            self.abort(
                request_id,
                GatewayError::Unavailable("gateway is shutting down".to_string()),
            );
        }
        tracing::info!(aborted, "Activation scheduler stopped");
    }
}
