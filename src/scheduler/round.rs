//! Partition sweeps of a single request and the terminal transitions.

use std::sync::Arc;

use tokio::time::Instant;

use crate::broker::{ActivatedJob, ActivationOutcome, FailJobCommand, PartitionClient, PartitionId};
use crate::error::GatewayError;
use crate::scheduler::long_polling::{LongPollingScheduler, SchedulerMessage};
use crate::scheduler::request::{InflightRequest, RequestId, RoundProgress};
use crate::scheduler::sink::Delivery;
use crate::scheduler::timer::ScheduledTask;

/// What the sweep does after a partition answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Poll the next partition.
    Continue,
    /// Stop sweeping and settle the round.
    Finish,
    /// The request reached a terminal state.
    Stop,
}

impl LongPollingScheduler {
    /// Start a sweep over all partitions.
    pub(super) fn start_round(&mut self, request_id: RequestId) {
        let partitions = self.client.partition_ids();
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if request.is_terminal() {
            return;
        }
        if partitions.is_empty() {
            self.abort(
                request_id,
                GatewayError::Unavailable("no partitions available".to_string()),
            );
            return;
        }

        request.set_active();
        request.dirty = false;
        request.round = RoundProgress::new(partitions);
        let job_type = request.job_type.clone();

        let state = self.job_type_state(&job_type);
        state.unblock(request_id);
        state.mark_active(request_id);

        self.poll_next_partition(request_id);
    }

    /// Issue the activation call for the next partition, or settle the round if none is left.
    fn poll_next_partition(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let Some(partition_id) = request.round.next_partition() else {
            self.finish_round(request_id);
            return;
        };

        let command = request.command(partition_id);
        let client = self.client.clone();
        let message_tx = self.message_tx.clone();
        tracing::trace!(request_id, partition_id, "Activating jobs on partition");

        tokio::spawn(async move {
            let outcome = client.activate_jobs(command).await;
            let message = SchedulerMessage::PartitionResponse {
                request_id,
                partition_id,
                outcome,
            };
            let undelivered = match message_tx.upgrade() {
                Some(tx) => tx.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };
            // Scheduler is gone; nobody will hand these jobs to a client.
            if let Some(SchedulerMessage::PartitionResponse {
                outcome: ActivationOutcome::Jobs(jobs),
                ..
            }) = undelivered
            {
                release(client, jobs, "activation scheduler stopped".to_string()).await;
            }
        });
    }

    pub(super) fn on_partition_response(
        &mut self,
        request_id: RequestId,
        partition_id: PartitionId,
        outcome: ActivationOutcome,
    ) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            tracing::warn!(request_id, partition_id, "Response for unknown activation request");
            if let ActivationOutcome::Jobs(jobs) = outcome {
                self.release_jobs(jobs, "activation request no longer exists");
            }
            return;
        };
        if !request.round.finish_partition(partition_id) {
            tracing::warn!(request_id, partition_id, "Unexpected partition response");
            if let ActivationOutcome::Jobs(jobs) = outcome {
                self.release_jobs(jobs, "unexpected activation response");
            }
            return;
        }
        if request.is_terminal() {
            // Finished while this call was in flight; it was kept around only for this response.
            self.requests.remove(&request_id);
            if let ActivationOutcome::Jobs(jobs) = outcome {
                self.release_jobs(jobs, "activation request was closed");
            }
            return;
        }

        tracing::trace!(request_id, partition_id, outcome = %outcome, "Partition responded");

        let step = match outcome {
            ActivationOutcome::Jobs(jobs) => self.deliver(request_id, jobs),
            ActivationOutcome::Empty => Step::Continue,
            ActivationOutcome::ResourceExhausted(message) => {
                request.round.record_exhausted(message);
                Step::Continue
            }
            ActivationOutcome::Failed(message) => {
                tracing::warn!(
                    request_id,
                    partition_id,
                    error = %message,
                    "Failed to activate jobs on partition"
                );
                request.round.record_error(partition_id, &message);
                Step::Continue
            }
            ActivationOutcome::Rejected {
                rejection_type,
                reason,
            } => {
                self.abort(
                    request_id,
                    GatewayError::Rejected {
                        rejection_type,
                        reason,
                    },
                );
                Step::Stop
            }
        };

        match step {
            Step::Continue => self.poll_next_partition(request_id),
            Step::Finish => self.finish_round(request_id),
            Step::Stop => {}
        }
    }

    /// Hand a partition's jobs to the client.
    ///
    /// Jobs past the remaining count or the message size limit are released. When delivery fails
    /// only this batch is released; earlier batches already belong to the client.
    fn deliver(&mut self, request_id: RequestId, jobs: Vec<ActivatedJob>) -> Step {
        let max_message_size = self.config.max_message_size;
        let Some(request) = self.requests.get_mut(&request_id) else {
            self.release_jobs(jobs, "activation request no longer exists");
            return Step::Stop;
        };

        let (batch, overflow) = split_batch(jobs, request.remaining() as usize, max_message_size);
        if !overflow.is_empty() {
            tracing::debug!(
                request_id,
                delivered = batch.len(),
                released = overflow.len(),
                "Batch exceeds response limits, releasing overflow"
            );
            self.release_jobs(overflow, "job does not fit into the activation response");
        }
        if batch.is_empty() {
            return Step::Continue;
        }

        let Some(request) = self.requests.get_mut(&request_id) else {
            return Step::Stop;
        };
        match request.try_send(&batch) {
            Ok(Delivery::Delivered) => {
                if request.remaining() == 0 {
                    Step::Finish
                } else {
                    Step::Continue
                }
            }
            Ok(Delivery::NotDelivered) => {
                tracing::warn!(
                    request_id,
                    jobs = batch.len(),
                    "Client did not accept activated jobs, releasing them"
                );
                self.release_jobs(batch, "activated jobs could not be delivered to the worker");
                self.abort(
                    request_id,
                    GatewayError::DeliveryFailed("client did not accept the response".to_string()),
                );
                Step::Stop
            }
            Err(e) => {
                tracing::warn!(
                    request_id,
                    jobs = batch.len(),
                    error = %e,
                    "Failed to deliver activated jobs, releasing them"
                );
                self.release_jobs(batch, "activated jobs could not be delivered to the worker");
                let error = match e {
                    GatewayError::DeliveryFailed(_) => e,
                    other => GatewayError::DeliveryFailed(other.to_string()),
                };
                self.abort(request_id, error);
                Step::Stop
            }
        }
    }

    /// Settle a request whose sweep is over.
    fn finish_round(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let job_type = request.job_type.clone();

        if request.activated_count > 0 {
            let retried = request.retried;
            self.job_type_state(&job_type).reset_empty_rounds();
            self.complete(request_id);
            // Peers mid-sweep may have missed jobs that were still being activated.
            if retried {
                self.cascade(&job_type, request_id);
            } else {
                self.mark_dirty(&job_type, Some(request_id));
            }
            return;
        }

        let errors = request.round.take_errors();
        if !errors.is_empty() {
            self.abort(request_id, GatewayError::PartitionsFailed { job_type, errors });
            return;
        }
        if let Some(message) = request.round.resource_exhausted() {
            let error = GatewayError::ResourceExhausted(message.to_string());
            self.abort(request_id, error);
            return;
        }

        let empty_rounds = self.job_type_state(&job_type).record_empty_round();
        tracing::trace!(request_id, job_type = %job_type, empty_rounds, "Empty round");
        self.settle_empty(request_id);
    }

    /// A clean empty round: complete, time out, sweep again, or block.
    fn settle_empty(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };

        if !request.is_long_polling() {
            self.complete(request_id);
        } else if request.is_timed_out_at(Instant::now()) {
            self.time_out(request_id);
        } else if request.dirty {
            tracing::trace!(request_id, "Jobs became available during the round, polling again");
            self.start_round(request_id);
        } else {
            self.block(request_id);
        }
    }

    /// Park a request until a notification, a probe, or its deadline.
    pub(super) fn block(&mut self, request_id: RequestId) {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        let Some(deadline) = request.deadline else {
            self.complete(request_id);
            return;
        };

        request.set_blocked();
        request.set_timer(ScheduledTask::at(
            deadline,
            self.message_tx.clone(),
            SchedulerMessage::DeadlineElapsed { request_id },
        ));
        let job_type = request.job_type.clone();
        self.job_type_state(&job_type).block(request_id);

        tracing::debug!(request_id, job_type = %job_type, "Activation request blocked");
    }

    pub(super) fn complete(&mut self, request_id: RequestId) {
        self.finalize(request_id, InflightRequest::complete);
    }

    pub(super) fn time_out(&mut self, request_id: RequestId) {
        self.finalize(request_id, InflightRequest::time_out);
    }

    pub(super) fn abort(&mut self, request_id: RequestId, error: GatewayError) {
        tracing::debug!(request_id, error = %error, "Aborting activation request");
        self.finalize(request_id, |request| request.abort(error));
    }

    /// Apply a terminal transition and drop the request from the registries.
    ///
    /// A request still waiting on a partition stays in the map until that response arrives so its
    /// jobs can be released.
    fn finalize<F>(&mut self, request_id: RequestId, transition: F)
    where
        F: FnOnce(&mut InflightRequest) -> bool,
    {
        let Some(request) = self.requests.get_mut(&request_id) else {
            return;
        };
        if !transition(request) {
            return;
        }

        let job_type = request.job_type.clone();
        let state = request.state();
        let activated = request.activated_count;
        let awaiting = request.awaiting_partition().is_some();

        if let Some(registry) = self.job_types.get_mut(&job_type) {
            registry.unblock(request_id);
            registry.mark_inactive(request_id);
        }
        if !awaiting {
            self.requests.remove(&request_id);
        }

        tracing::debug!(
            request_id,
            job_type = %job_type,
            state = %state,
            activated,
            "Activation request finished"
        );
    }

    /// Fail `jobs` back to their partitions so another worker can pick them up right away.
    pub(super) fn release_jobs(&self, jobs: Vec<ActivatedJob>, reason: &str) {
        if jobs.is_empty() {
            return;
        }
        tokio::spawn(release(self.client.clone(), jobs, reason.to_string()));
    }
}

/// Split `jobs` into the part that fits into one response and the part to release.
///
/// Order is preserved: once a job does not fit, every later job is released too.
fn split_batch(
    jobs: Vec<ActivatedJob>,
    remaining: usize,
    max_message_size: usize,
) -> (Vec<ActivatedJob>, Vec<ActivatedJob>) {
    let mut batch = Vec::with_capacity(jobs.len().min(remaining));
    let mut overflow = Vec::new();
    let mut size = 0;

    for job in jobs {
        let len = job.encoded_len();
        if overflow.is_empty() && batch.len() < remaining && size + len <= max_message_size {
            size += len;
            batch.push(job);
        } else {
            overflow.push(job);
        }
    }
    (batch, overflow)
}

async fn release(client: Arc<dyn PartitionClient>, jobs: Vec<ActivatedJob>, reason: String) {
    for job in jobs {
        let command = FailJobCommand::release(&job, reason.clone());
        match client.fail_job(command).await {
            Ok(()) => {
                tracing::debug!(job_key = job.key, partition_id = job.partition_id, "Job released");
            }
            Err(e) => {
                tracing::warn!(
                    job_key = job.key,
                    partition_id = job.partition_id,
                    error = %e,
                    "Failed to release job"
                );
            }
        }
    }
}
