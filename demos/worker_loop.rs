//! Workers that keep a long polling request open at all times.
//!
//! Each worker issues an activation request, handles jobs as they are streamed back and issues
//! the next request as soon as the previous one finishes. A producer adds bursts of jobs to random
//! partitions and tells the gateway about them.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use activation_gateway::broker::{InMemoryBroker, PartitionClient};
use activation_gateway::scheduler::{
    ActivateJobsRequest, ActivationEvent, LongPollingScheduler, SchedulerHandle,
};
use activation_gateway::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "worker-loop")]
#[command(about = "Long polling workers against in-memory partitions")]
struct Args {
    /// Number of partitions
    #[arg(long, default_value = "3")]
    partitions: u32,

    /// Number of workers
    #[arg(long, default_value = "3")]
    workers: u32,

    /// Number of bursts the producer creates
    #[arg(long, default_value = "4")]
    bursts: u32,

    /// Jobs per burst
    #[arg(long, default_value = "6")]
    burst_size: usize,

    /// Pause between bursts in milliseconds
    #[arg(long, default_value = "2000")]
    burst_interval_ms: u64,

    /// Long polling timeout of each worker request in milliseconds
    #[arg(long, default_value = "5000")]
    request_timeout_ms: i64,
}

const JOB_TYPE: &str = "demo";

async fn run_worker(
    name: String,
    handle: SchedulerHandle,
    timeout_ms: i64,
    stop: CancellationToken,
) {
    let mut handled = 0usize;

    while !stop.is_cancelled() {
        let request = ActivateJobsRequest::new(JOB_TYPE, 2)
            .with_worker(name.clone())
            .with_request_timeout(timeout_ms);
        let mut stream = match handle.activate_jobs(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(worker = %name, error = %e, "Activation request rejected");
                break;
            }
        };

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => {
                    stream.cancel();
                    break;
                }
                event = stream.next() => event,
            };
            match event {
                Some(ActivationEvent::Jobs(jobs)) => {
                    for job in jobs {
                        tracing::info!(
                            worker = %name,
                            key = job.key,
                            partition = job.partition_id,
                            "Handling job"
                        );
                        handled += 1;
                    }
                }
                Some(ActivationEvent::Completed(completion)) => {
                    tracing::debug!(worker = %name, %completion, "Request finished");
                }
                Some(ActivationEvent::Failed(e)) => {
                    tracing::warn!(worker = %name, error = %e, "Request failed");
                    if !e.is_retryable() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                None => break,
            }
        }
    }

    tracing::info!(worker = %name, handled, "Worker stopped");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let broker = Arc::new(InMemoryBroker::new(args.partitions));
    let client: Arc<dyn PartitionClient> = broker.clone();
    let shutdown = CancellationToken::new();
    let (handle, scheduler) =
        LongPollingScheduler::spawn(GatewayConfig::default(), client, shutdown.clone())?;

    let stop = CancellationToken::new();
    let workers: Vec<_> = (1..=args.workers)
        .map(|n| {
            tokio::spawn(run_worker(
                format!("worker-{n}"),
                handle.clone(),
                args.request_timeout_ms,
                stop.clone(),
            ))
        })
        .collect();

    for burst in 0..args.bursts {
        tokio::time::sleep(Duration::from_millis(args.burst_interval_ms)).await;
        for n in 0..args.burst_size {
            let partition = ((burst as usize + n) as u32 % args.partitions.max(1)) + 1;
            broker.add_jobs(partition, JOB_TYPE, 1);
        }
        tracing::info!(burst = burst + 1, jobs = args.burst_size, "Jobs created");
        handle.notify_jobs_available(JOB_TYPE);
    }

    tokio::time::sleep(Duration::from_millis(args.burst_interval_ms)).await;
    stop.cancel();
    for worker in workers {
        worker.await?;
    }

    shutdown.cancel();
    scheduler.await?;

    println!("Activation calls: {}", broker.activation_count());
    println!("Remaining jobs:   {}", broker.available_jobs(JOB_TYPE));
    Ok(())
}
