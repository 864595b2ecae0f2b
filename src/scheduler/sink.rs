use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::broker::ActivatedJob;
use crate::error::{GatewayError, Result};
use crate::scheduler::request::RequestId;

/// Outcome of pushing a batch towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The client could not take the batch right now; nothing was sent.
    NotDelivered,
}

/// How a request ended when it did not end in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Completion {
    /// At least one batch was delivered.
    Activated,
    /// A single sweep found nothing and the request does not long poll.
    NoJobs,
    /// The request deadline passed while waiting for jobs.
    TimedOut,
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Activated => write!(f, "activated"),
            Completion::NoJobs => write!(f, "no_jobs"),
            Completion::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Per-request channel back to the client.
///
/// `try_send` returning an error means the batch may or may not have reached the client; the
/// scheduler treats both `NotDelivered` and errors as a delivery failure and releases the batch.
/// The scheduler calls exactly one of `complete` or `fail`, exactly once.
pub trait ResponseSink: Send {
    fn try_send(&mut self, jobs: &[ActivatedJob]) -> Result<Delivery>;

    fn complete(&mut self, completion: Completion);

    fn fail(&mut self, error: GatewayError);
}

/// Events observed by a client reading an [`ActivationStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationEvent {
    Jobs(Vec<ActivatedJob>),
    Completed(Completion),
    Failed(GatewayError),
}

/// [`ResponseSink`] feeding a bounded channel read through an [`ActivationStream`].
///
/// One slot of the channel is reserved up front so the terminal event always fits, even when the
/// client has stopped reading batches.
pub struct ChannelSink {
    batches: Option<mpsc::Sender<ActivationEvent>>,
    terminal: Option<OwnedPermit<ActivationEvent>>,
}

impl ChannelSink {
    fn finish(&mut self, event: ActivationEvent) {
        let batches = self.batches.take();
        match self.terminal.take() {
            Some(permit) => {
                permit.send(event);
            }
            None => {
                if let Some(tx) = batches {
                    let _ = tx.try_send(event);
                }
            }
        }
    }
}

impl ResponseSink for ChannelSink {
    fn try_send(&mut self, jobs: &[ActivatedJob]) -> Result<Delivery> {
        let Some(tx) = self.batches.as_ref() else {
            return Err(GatewayError::DeliveryFailed(
                "response stream is already finished".to_string(),
            ));
        };
        match tx.try_send(ActivationEvent::Jobs(jobs.to_vec())) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(TrySendError::Full(_)) => Ok(Delivery::NotDelivered),
            Err(TrySendError::Closed(_)) => Err(GatewayError::DeliveryFailed(
                "client disconnected".to_string(),
            )),
        }
    }

    fn complete(&mut self, completion: Completion) {
        self.finish(ActivationEvent::Completed(completion));
    }

    fn fail(&mut self, error: GatewayError) {
        self.finish(ActivationEvent::Failed(error));
    }
}

/// Jobs activated for one request, followed by exactly one terminal event.
///
/// Dropping the stream cancels the request; jobs the scheduler activates after that point are
/// released back to the broker.
pub struct ActivationStream {
    request_id: RequestId,
    events: ReceiverStream<ActivationEvent>,
    cancel: CancellationToken,
    _cancel_on_drop: DropGuard,
}

/// Jobs and completion of a request that ended without an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationResult {
    pub request_id: RequestId,
    pub jobs: Vec<ActivatedJob>,
    pub completion: Completion,
}

impl ActivationStream {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Ask the scheduler to abort the request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the stream into the activated jobs and the completion.
    pub async fn collect_jobs(mut self) -> Result<ActivationResult> {
        use tokio_stream::StreamExt;

        let mut jobs = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                ActivationEvent::Jobs(batch) => jobs.extend(batch),
                ActivationEvent::Completed(completion) => {
                    return Ok(ActivationResult {
                        request_id: self.request_id,
                        jobs,
                        completion,
                    })
                }
                ActivationEvent::Failed(error) => return Err(error),
            }
        }
        Err(GatewayError::Unavailable(
            "scheduler stopped before the request finished".to_string(),
        ))
    }
}

impl Stream for ActivationStream {
    type Item = ActivationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Create the sink handed to the scheduler and the stream handed to the client.
pub fn response_channel(
    request_id: RequestId,
    capacity: usize,
    cancel: CancellationToken,
) -> (ChannelSink, ActivationStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
    let terminal = tx.clone().try_reserve_owned().ok();

    let sink = ChannelSink {
        batches: Some(tx),
        terminal,
    };
    let stream = ActivationStream {
        request_id,
        events: ReceiverStream::new(rx),
        _cancel_on_drop: cancel.clone().drop_guard(),
        cancel,
    };
    (sink, stream)
}
