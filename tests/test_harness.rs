//! Test harness for activation scheduler integration tests.
//!
//! Spawns a scheduler in front of an in-memory broker and provides polling helpers. Tests run
//! on a paused clock, so every wait advances virtual time only.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use activation_gateway::broker::{ActivatedJob, InMemoryBroker, JobKey, PartitionClient};
use activation_gateway::config::GatewayConfig;
use activation_gateway::error::{GatewayError, Result};
use activation_gateway::scheduler::{
    ActivateJobsRequest, ActivationResult, Completion, Delivery, LongPollingScheduler,
    ResponseSink, SchedulerHandle, SchedulerStats,
};

/// Upper bound for every wait in the suite, in virtual time.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway configuration used by the suite.
///
/// The probe is pushed far out so it never interferes unless a test asks for it.
pub fn test_config() -> GatewayConfig {
    GatewayConfig::default()
        .with_long_polling_timeout(60_000)
        .with_probe_timeout(600_000)
        .with_min_empty_responses(3)
}

/// Scheduler running in front of an in-memory broker
pub struct TestGateway {
    pub broker: Arc<InMemoryBroker>,
    pub handle: SchedulerHandle,
    pub shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TestGateway {
    pub fn start(partitions: u32) -> Self {
        Self::start_with(InMemoryBroker::new(partitions), test_config())
    }

    pub fn start_with(broker: InMemoryBroker, config: GatewayConfig) -> Self {
        let broker = Arc::new(broker);
        let client: Arc<dyn PartitionClient> = broker.clone();
        let shutdown = CancellationToken::new();
        let (handle, task) = LongPollingScheduler::spawn(config, client, shutdown.clone())
            .expect("valid test configuration");

        Self {
            broker,
            handle,
            shutdown,
            task: Some(task),
        }
    }

    /// Submit a request and collect its result on a separate task.
    pub async fn activate(
        &self,
        request: ActivateJobsRequest,
    ) -> JoinHandle<Result<ActivationResult>> {
        let stream = self
            .handle
            .activate_jobs(request)
            .await
            .expect("request accepted");
        tokio::spawn(stream.collect_jobs())
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.handle.stats().await.expect("scheduler running")
    }

    /// Poll the scheduler state until `condition` holds.
    pub async fn wait_for_stats<F>(&self, condition: F) -> SchedulerStats
    where
        F: Fn(&SchedulerStats) -> bool,
    {
        let start = Instant::now();
        loop {
            let stats = self.stats().await;
            if condition(&stats) {
                return stats;
            }
            if start.elapsed() >= WAIT_TIMEOUT {
                panic!("scheduler never reached the expected state: {stats:?}");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn wait_for_blocked(&self, job_type: &str, blocked: usize) -> SchedulerStats {
        self.wait_for_stats(|stats| stats.blocked(job_type) == blocked)
            .await
    }

    /// Keys of the jobs released back to the broker, in arrival order.
    pub fn released_keys(&self) -> Vec<JobKey> {
        self.broker.failed_jobs().iter().map(|cmd| cmd.key).collect()
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Poll `condition` until it holds or the virtual timeout passes.
pub async fn wait_until<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F>(condition: F, message: &str)
where
    F: Fn() -> bool,
{
    assert!(wait_until(condition).await, "{message}");
}

/// What a [`ScriptedSink`] observed.
#[derive(Debug, Default)]
pub struct SinkLog {
    pub attempted: Vec<Vec<JobKey>>,
    pub delivered: Vec<Vec<JobKey>>,
    pub completion: Option<Completion>,
    pub failure: Option<GatewayError>,
}

impl SinkLog {
    pub fn is_finished(&self) -> bool {
        self.completion.is_some() || self.failure.is_some()
    }
}

/// Sink answering each `try_send` with the next scripted result, then `Delivered`.
pub struct ScriptedSink {
    script: Vec<Result<Delivery>>,
    log: Arc<Mutex<SinkLog>>,
}

impl ScriptedSink {
    pub fn new(script: Vec<Result<Delivery>>) -> (Box<dyn ResponseSink>, Arc<Mutex<SinkLog>>) {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut script = script;
        script.reverse();
        let sink = Self {
            script,
            log: log.clone(),
        };
        (Box::new(sink), log)
    }
}

impl ResponseSink for ScriptedSink {
    fn try_send(&mut self, jobs: &[ActivatedJob]) -> Result<Delivery> {
        let keys: Vec<JobKey> = jobs.iter().map(|job| job.key).collect();
        let result = self.script.pop().unwrap_or(Ok(Delivery::Delivered));

        let mut log = self.log.lock().unwrap();
        log.attempted.push(keys.clone());
        if matches!(result, Ok(Delivery::Delivered)) {
            log.delivered.push(keys);
        }
        result
    }

    fn complete(&mut self, completion: Completion) {
        let mut log = self.log.lock().unwrap();
        assert!(!log.is_finished(), "sink finalized twice");
        log.completion = Some(completion);
    }

    fn fail(&mut self, error: GatewayError) {
        let mut log = self.log.lock().unwrap();
        assert!(!log.is_finished(), "sink finalized twice");
        log.failure = Some(error);
    }
}
