use std::time::Duration;

use tokio::sync::mpsc::WeakSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::scheduler::long_polling::SchedulerMessage;

/// A callback scheduled into the scheduler loop.
///
/// The callback runs on its own task and reports back by sending a message, so the loop itself
/// never sleeps. Cancelling is idempotent and dropping the handle cancels the callback. A message
/// that was already queued when the timer got cancelled is still delivered; handlers must treat
/// it as a possible no-op.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Deliver `message` once `deadline` is reached.
    pub fn at(
        deadline: Instant,
        tx: WeakSender<SchedulerMessage>,
        message: SchedulerMessage,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message).await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Deliver a fresh message every `period`, starting one period from now.
    pub fn every<F>(period: Duration, tx: WeakSender<SchedulerMessage>, mut message: F) -> Self
    where
        F: FnMut() -> SchedulerMessage + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(tx) = tx.upgrade() else {
                    break;
                };
                if tx.send(message()).await.is_err() {
                    break;
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Deliver `message` when `token` is cancelled.
    pub fn on_cancel(
        token: CancellationToken,
        tx: WeakSender<SchedulerMessage>,
        message: SchedulerMessage,
    ) -> Self {
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message).await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
