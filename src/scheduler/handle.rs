use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::scheduler::long_polling::SchedulerMessage;
use crate::scheduler::registry::SchedulerStats;
use crate::scheduler::request::{ActivateJobsRequest, RequestId};
use crate::scheduler::sink::{response_channel, ActivationStream, ResponseSink};

/// Cloneable entry point into a running [`LongPollingScheduler`].
///
/// [`LongPollingScheduler`]: crate::scheduler::LongPollingScheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    message_tx: mpsc::Sender<SchedulerMessage>,
    next_request_id: Arc<AtomicU64>,
    response_buffer: usize,
}

impl SchedulerHandle {
    pub(crate) fn new(message_tx: mpsc::Sender<SchedulerMessage>, response_buffer: usize) -> Self {
        Self {
            message_tx,
            next_request_id: Arc::new(AtomicU64::new(1)),
            response_buffer,
        }
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a request and get the stream of activated jobs back.
    ///
    /// Dropping the stream cancels the request.
    pub async fn activate_jobs(&self, request: ActivateJobsRequest) -> Result<ActivationStream> {
        request.validate()?;
        let request_id = self.next_request_id();
        let cancel = CancellationToken::new();
        let (sink, stream) = response_channel(request_id, self.response_buffer, cancel.clone());

        self.send(SchedulerMessage::Activate {
            request_id,
            request,
            sink: Box::new(sink),
            cancel: Some(cancel),
        })
        .await?;
        Ok(stream)
    }

    /// Submit a request answered through a caller-provided sink.
    pub async fn submit(
        &self,
        request: ActivateJobsRequest,
        sink: Box<dyn ResponseSink>,
    ) -> Result<RequestId> {
        request.validate()?;
        let request_id = self.next_request_id();
        self.send(SchedulerMessage::Activate {
            request_id,
            request,
            sink,
            cancel: None,
        })
        .await?;
        Ok(request_id)
    }

    /// Tell the scheduler that jobs of `job_type` may be available.
    ///
    /// Never waits; the hint is dropped when the scheduler is saturated, the probe timer covers it.
    pub fn notify_jobs_available(&self, job_type: &str) {
        let message = SchedulerMessage::JobsAvailable {
            job_type: job_type.to_string(),
        };
        match self.message_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(job_type, "Scheduler busy, dropping jobs available notification");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!(job_type, "Scheduler stopped, dropping jobs available notification");
            }
        }
    }

    pub async fn cancel(&self, request_id: RequestId) -> Result<()> {
        self.send(SchedulerMessage::Cancel { request_id }).await
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerMessage::Stats { response_tx }).await?;
        response_rx.await.map_err(|_| scheduler_stopped())
    }

    async fn send(&self, message: SchedulerMessage) -> Result<()> {
        self.message_tx
            .send(message)
            .await
            .map_err(|_| scheduler_stopped())
    }
}

fn scheduler_stopped() -> GatewayError {
    GatewayError::Unavailable("activation scheduler is not running".to_string())
}
