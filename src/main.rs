use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use job_worker::config::{
    AdmissionConfig, BrokerConfig, BrokerKind, ConsumerConfig, DockerConfig, SandboxConfig,
    StoreConfig, StoreKind, WorkerConfig, DEFAULT_RESULTS_SIZE_LIMIT,
};
use job_worker::node::WorkerNode;
use job_worker::resources::{
    AdmissionDecision, LinuxResourceSampler, ResourceAdmissionController, ResourceSnapshot,
    RunningJobs,
};
use job_worker::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "job-worker")]
#[command(version)]
#[command(about = "Batch job worker: consumes job requests and runs them in containers")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "JOB_WORKER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the worker
    Run(RunArgs),

    /// Show local resource usage and whether a job would be admitted
    Resources {
        #[command(flatten)]
        limits: LimitArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BrokerArg {
    Memory,
    Kafka,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    Memory,
    Postgres,
}

// =============================================================================
// Arguments
// =============================================================================

/// Sandbox location, per-job budget and admission thresholds.
#[derive(Parser, Debug)]
struct LimitArgs {
    /// Root directory of the per-job sandboxes
    #[arg(long, env = "JOB_WORKER_JOBS_DIR", default_value = "/tmp/jobs")]
    jobs_dir: PathBuf,

    /// CPU budget of one job, in cores
    #[arg(long, env = "JOB_WORKER_JOB_CPU", default_value = "0.5")]
    job_cpu: f64,

    /// Memory budget of one job, in MiB
    #[arg(long, env = "JOB_WORKER_JOB_MEMORY_MB", default_value = "512")]
    job_memory_mb: u64,

    /// Maximum CPU usage fraction before new jobs are refused
    #[arg(long, env = "JOB_WORKER_MAX_CPU", default_value = "0.8")]
    max_cpu: f64,

    /// Maximum memory usage fraction, including the next job's budget
    #[arg(long, env = "JOB_WORKER_MAX_MEMORY", default_value = "0.8")]
    max_memory: f64,

    /// Maximum disk usage fraction of the jobs directory
    #[arg(long, env = "JOB_WORKER_MAX_DISK", default_value = "0.8")]
    max_disk: f64,

    /// Maximum number of jobs running at once
    #[arg(long, env = "JOB_WORKER_MAX_JOBS", default_value = "16")]
    max_jobs: usize,
}

impl LimitArgs {
    fn sandbox(&self) -> SandboxConfig {
        SandboxConfig {
            jobs_directory: self.jobs_dir.clone(),
            cpu_limit: self.job_cpu,
            memory_limit_mb: self.job_memory_mb,
            definition_template: None,
        }
    }

    fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_cpu_usage: self.max_cpu,
            max_memory_usage: self.max_memory,
            max_disk_usage: self.max_disk,
            max_running_jobs: self.max_jobs,
            ..AdmissionConfig::default()
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    limits: LimitArgs,

    /// Container definition template (the built-in template is used when unset)
    #[arg(long, env = "JOB_WORKER_DEFINITION_TEMPLATE")]
    definition_template: Option<PathBuf>,

    /// Delay between two consume iterations, in milliseconds
    #[arg(long, env = "JOB_WORKER_ITERATION_DELAY_MS", default_value = "1000")]
    iteration_delay_ms: u64,

    // === Broker ===
    /// Message broker implementation
    #[arg(long, env = "JOB_WORKER_BROKER", default_value = "memory")]
    broker: BrokerArg,

    /// Kafka bootstrap servers
    #[arg(long, env = "JOB_WORKER_BROKER_SERVERS", default_value = "localhost:9092")]
    broker_servers: String,

    /// Topic carrying job requests
    #[arg(long, env = "JOB_WORKER_TOPIC", default_value = "jobs")]
    topic: String,

    /// Consumer group shared by all workers
    #[arg(long, env = "JOB_WORKER_GROUP_ID", default_value = "job-workers")]
    group_id: String,

    /// Client id reported to the broker (defaults to the host name)
    #[arg(long, env = "JOB_WORKER_CLIENT_ID")]
    client_id: Option<String>,

    // === Store ===
    /// Job store implementation
    #[arg(long, env = "JOB_WORKER_STORE", default_value = "memory")]
    store: StoreArg,

    /// Postgres connection URL
    #[arg(long, env = "JOB_WORKER_STORE_URL", default_value = "postgres://localhost/Jobs")]
    store_url: String,

    /// Maximum pooled store connections
    #[arg(long, env = "JOB_WORKER_STORE_MAX_CONNECTIONS", default_value = "4")]
    store_max_connections: u32,

    // === Container runtime ===
    /// Docker API endpoint
    #[arg(long, env = "JOB_WORKER_DOCKER_URL", default_value = "unix:///var/run/docker.sock")]
    docker_url: String,

    /// Image jobs run in
    #[arg(long, env = "JOB_WORKER_IMAGE", default_value = "alpine")]
    image: String,

    /// Allow job containers to reach the network
    #[arg(long, env = "JOB_WORKER_ALLOW_NETWORK")]
    allow_network: bool,

    // === Status endpoint ===
    /// Port for the read-only status endpoint (optional)
    #[arg(long, env = "JOB_WORKER_STATUS_PORT")]
    status_port: Option<u16>,

    // === Local queue ===
    /// Script to submit on startup; only with the in-memory broker and store
    #[arg(long)]
    submit: Vec<PathBuf>,

    /// Timeout of submitted scripts, in seconds
    #[arg(long, default_value = "60")]
    submit_timeout_secs: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn host_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "job-worker".to_string())
}

fn worker_config(args: &RunArgs) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let status_addr: Option<SocketAddr> = match args.status_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let sandbox = SandboxConfig {
        definition_template: args.definition_template.clone(),
        ..args.limits.sandbox()
    };

    Ok(WorkerConfig {
        sandbox,
        docker: DockerConfig {
            url: args.docker_url.clone(),
            image: args.image.clone(),
            network_disabled: !args.allow_network,
            ..DockerConfig::default()
        },
        admission: args.limits.admission(),
        consumer: ConsumerConfig {
            iteration_delay: Duration::from_millis(args.iteration_delay_ms),
        },
        broker: BrokerConfig {
            kind: match args.broker {
                BrokerArg::Memory => BrokerKind::Memory,
                BrokerArg::Kafka => BrokerKind::Kafka,
            },
            servers: args.broker_servers.clone(),
            topic: args.topic.clone(),
            group_id: args.group_id.clone(),
            client_id: args.client_id.clone().unwrap_or_else(host_name),
        },
        store: StoreConfig {
            kind: match args.store {
                StoreArg::Memory => StoreKind::Memory,
                StoreArg::Postgres => StoreKind::Postgres,
            },
            url: args.store_url.clone(),
            max_connections: args.store_max_connections,
            results_size_limit: DEFAULT_RESULTS_SIZE_LIMIT,
            ..StoreConfig::default()
        },
        status_addr,
    })
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = worker_config(&args)?;
    let worker_id = config.broker.client_id.clone();

    let shutdown = install_shutdown_handler()?;
    let node = WorkerNode::connect(config, worker_id).await?;

    if !args.submit.is_empty() {
        let Some(local) = node.local.clone() else {
            return Err("--submit requires the in-memory broker and store".into());
        };
        let timeout = Duration::from_secs(args.submit_timeout_secs);
        for path in &args.submit {
            let script = tokio::fs::read(path).await?;
            local.submit(&script, timeout).await?;
        }
    }

    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Resources
// =============================================================================

/// The resources command runs outside a worker, so nothing is in flight.
struct NoRunningJobs;

impl RunningJobs for NoRunningJobs {
    fn running_count(&self) -> usize {
        0
    }
}

#[derive(Serialize)]
struct ResourcesOutput {
    cpu_usage: f64,
    memory_total_bytes: u64,
    memory_available_bytes: u64,
    memory_usage: f64,
    disk_total_bytes: u64,
    disk_free_bytes: u64,
    disk_usage: f64,
    admitted: bool,
    decision: String,
}

fn describe(decision: &AdmissionDecision) -> String {
    match decision {
        AdmissionDecision::Admit => "admit".to_string(),
        AdmissionDecision::TooManyJobs { running, max } => {
            format!("too many jobs ({running} > {max})")
        }
        AdmissionDecision::CpuBusy { usage } => format!("cpu busy ({:.1}%)", usage * 100.0),
        AdmissionDecision::MemoryLow { projected, .. } => {
            format!("memory low ({:.1}% with next job)", projected * 100.0)
        }
        AdmissionDecision::DiskFull { usage } => format!("disk full ({:.1}%)", usage * 100.0),
    }
}

async fn show_resources(
    limits: LimitArgs,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let controller = ResourceAdmissionController::new(
        Arc::new(NoRunningJobs),
        Arc::new(LinuxResourceSampler::new()),
        limits.admission(),
        &limits.sandbox(),
    );
    let ResourceSnapshot {
        cpu_usage,
        memory,
        disk,
        decision,
    } = controller.snapshot().await?;

    let report = ResourcesOutput {
        cpu_usage,
        memory_total_bytes: memory.total_bytes,
        memory_available_bytes: memory.available_bytes,
        memory_usage: memory.usage_fraction(),
        disk_total_bytes: disk.total_bytes,
        disk_free_bytes: disk.free_bytes,
        disk_usage: disk.usage_fraction(),
        admitted: decision.is_admitted(),
        decision: describe(&decision),
    };

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => {
            const MIB: f64 = 1024.0 * 1024.0;
            println!(
                "{:<10} {:>8} {:>14} {:>14}",
                "RESOURCE", "USAGE", "TOTAL (MiB)", "FREE (MiB)"
            );
            println!("{}", "-".repeat(49));
            println!(
                "{:<10} {:>7.1}% {:>14} {:>14}",
                "cpu",
                report.cpu_usage * 100.0,
                "-",
                "-"
            );
            println!(
                "{:<10} {:>7.1}% {:>14.0} {:>14.0}",
                "memory",
                report.memory_usage * 100.0,
                report.memory_total_bytes as f64 / MIB,
                report.memory_available_bytes as f64 / MIB
            );
            println!(
                "{:<10} {:>7.1}% {:>14.0} {:>14.0}",
                "disk",
                report.disk_usage * 100.0,
                report.disk_total_bytes as f64 / MIB,
                report.disk_free_bytes as f64 / MIB
            );
            println!();
            println!("Admission: {}", report.decision);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    match args.command {
        Commands::Run(run_args) => run_worker(run_args).await,
        Commands::Resources { limits, output } => show_resources(limits, output).await,
    }
}
