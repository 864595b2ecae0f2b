use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use activation_gateway::broker::{InMemoryBroker, JobKey, PartitionClient};
use activation_gateway::config::{
    GatewayConfig, DEFAULT_LONG_POLLING_TIMEOUT_MS, DEFAULT_MIN_EMPTY_RESPONSES,
    DEFAULT_PROBE_TIMEOUT_MS,
};
use activation_gateway::scheduler::{ActivateJobsRequest, LongPollingScheduler};
use activation_gateway::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "activation-gateway")]
#[command(version)]
#[command(about = "Long polling job activation gateway")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run activation requests against in-memory partitions
    Simulate(SimulateArgs),

    /// Print the effective gateway configuration
    Config {
        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct GatewayArgs {
    /// Default long polling timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_LONG_POLLING_TIMEOUT_MS)]
    long_polling_timeout_ms: u64,

    /// Period of the probe that retries blocked requests, in milliseconds
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_MS)]
    probe_timeout_ms: u64,

    /// Empty rounds after which new requests block without polling
    #[arg(long, default_value_t = DEFAULT_MIN_EMPTY_RESPONSES)]
    min_empty_responses: u32,

    /// Disable long polling; every request sweeps once and completes
    #[arg(long)]
    no_long_polling: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl GatewayArgs {
    fn to_config(&self) -> GatewayConfig {
        GatewayConfig::default()
            .with_long_polling_timeout(self.long_polling_timeout_ms)
            .with_probe_timeout(self.probe_timeout_ms)
            .with_min_empty_responses(self.min_empty_responses)
            .with_long_polling_enabled(!self.no_long_polling)
    }
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    #[command(flatten)]
    gateway: GatewayArgs,

    /// Number of partitions
    #[arg(long, default_value = "3")]
    partitions: u32,

    /// Job type requested by every worker
    #[arg(long, default_value = "payment")]
    job_type: String,

    /// Number of concurrent activation requests
    #[arg(long, default_value = "4")]
    requests: u32,

    /// Maximum jobs per request
    #[arg(long, default_value = "2")]
    max_jobs: u32,

    /// Request timeout in milliseconds (negative: never block, 0: gateway default)
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    request_timeout_ms: i64,

    /// Jobs created after the requests were submitted
    #[arg(long, default_value = "5")]
    jobs: usize,

    /// Delay before the jobs are created, in milliseconds
    #[arg(long, default_value = "500")]
    job_delay_ms: u64,

    /// Do not notify the gateway when jobs are created; only the probe finds them
    #[arg(long)]
    silent: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RequestOutput {
    request: u32,
    outcome: String,
    jobs: Vec<JobKey>,
    elapsed_ms: u128,
    error: Option<String>,
}

#[derive(Serialize)]
struct SimulationOutput {
    requests: Vec<RequestOutput>,
    activation_calls: usize,
    released_jobs: usize,
    remaining_jobs: usize,
}

// =============================================================================
// Simulation
// =============================================================================

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.gateway.to_config();
    let shutdown = install_shutdown_handler()?;

    let broker = Arc::new(InMemoryBroker::new(args.partitions));
    let client: Arc<dyn PartitionClient> = broker.clone();
    let (handle, scheduler_task) = LongPollingScheduler::spawn(config, client, shutdown.clone())?;

    tracing::info!(
        partitions = args.partitions,
        requests = args.requests,
        jobs = args.jobs,
        job_type = %args.job_type,
        "Starting simulation"
    );

    let mut workers = Vec::with_capacity(args.requests as usize);
    for index in 0..args.requests {
        let handle = handle.clone();
        let request = ActivateJobsRequest::new(args.job_type.clone(), args.max_jobs)
            .with_request_timeout(args.request_timeout_ms)
            .with_worker(format!("worker-{}", index + 1));
        workers.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = match handle.activate_jobs(request).await {
                Ok(stream) => stream.collect_jobs().await,
                Err(e) => Err(e),
            };
            (index + 1, started.elapsed(), result)
        }));
    }

    let producer = {
        let broker = broker.clone();
        let handle = handle.clone();
        let job_type = args.job_type.clone();
        let partitions = args.partitions.max(1);
        let (jobs, delay, silent) = (args.jobs, args.job_delay_ms, args.silent);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            for n in 0..jobs {
                let partition = (n as u32 % partitions) + 1;
                broker.add_jobs(partition, &job_type, 1);
            }
            tracing::info!(jobs, "Jobs created");
            if !silent {
                handle.notify_jobs_available(&job_type);
            }
        })
    };

    let mut outputs = Vec::with_capacity(workers.len());
    for worker in workers {
        let (request, elapsed, result) = worker.await?;
        let output = match result {
            Ok(result) => RequestOutput {
                request,
                outcome: result.completion.to_string(),
                jobs: result.jobs.iter().map(|job| job.key).collect(),
                elapsed_ms: elapsed.as_millis(),
                error: None,
            },
            Err(e) => RequestOutput {
                request,
                outcome: "error".to_string(),
                jobs: Vec::new(),
                elapsed_ms: elapsed.as_millis(),
                error: Some(e.to_string()),
            },
        };
        outputs.push(output);
    }
    producer.await?;

    shutdown.cancel();
    scheduler_task.await?;

    let output = SimulationOutput {
        requests: outputs,
        activation_calls: broker.activation_count(),
        released_jobs: broker.failed_jobs().len(),
        remaining_jobs: broker.available_jobs(&args.job_type),
    };
    print_simulation(&output, &args.gateway.output)
}

fn print_simulation(
    output: &SimulationOutput,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(output)?);
        }
        OutputFormat::Table => {
            println!("{:<9} {:<11} {:<10} JOBS", "REQUEST", "OUTCOME", "ELAPSED");
            println!("{}", "-".repeat(50));
            for request in &output.requests {
                let jobs = match &request.error {
                    Some(error) => error.clone(),
                    None => format!("{:?}", request.jobs),
                };
                println!(
                    "{:<9} {:<11} {:<10} {}",
                    request.request,
                    request.outcome,
                    format!("{}ms", request.elapsed_ms),
                    jobs
                );
            }
            println!();
            println!("Activation calls: {}", output.activation_calls);
            println!("Released jobs:    {}", output.released_jobs);
            println!("Remaining jobs:   {}", output.remaining_jobs);
        }
    }
    Ok(())
}

fn print_config(args: &GatewayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config();
    config.validate()?;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Table => {
            let long_polling = &config.long_polling;
            println!("Long polling:        {}", long_polling.enabled);
            println!("Timeout:             {}ms", long_polling.timeout_ms);
            println!("Probe timeout:       {}ms", long_polling.probe_timeout_ms);
            println!("Min empty responses: {}", long_polling.min_empty_responses);
            println!("Max message size:    {} bytes", config.max_message_size);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Simulate(args) => run_simulation(args).await,
        Commands::Config { gateway } => print_config(&gateway),
    }
}
