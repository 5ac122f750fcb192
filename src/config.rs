use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Size ceiling for job results accepted by the store (50 MiB).
pub const DEFAULT_RESULTS_SIZE_LIMIT: usize = 50 * 1024 * 1024;

/// Configuration for per-job sandboxes and the resources one job may use.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Root directory; every job gets a subdirectory named by its id
    pub jobs_directory: PathBuf,
    /// CPU budget of one job, in cores (e.g. 0.5)
    pub cpu_limit: f64,
    /// Memory budget of one job, in MiB
    pub memory_limit_mb: u64,
    /// Container definition template. The embedded template is used when unset.
    pub definition_template: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            jobs_directory: PathBuf::from("/tmp/jobs"),
            cpu_limit: 0.5,
            memory_limit_mb: 512,
            definition_template: None,
        }
    }
}

impl SandboxConfig {
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    /// CPU budget in the runtime's nanocore unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }
}

/// Configuration of the container runtime.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker API endpoint, `unix://` socket or `http://` URL
    pub url: String,
    /// Image every job runs in
    pub image: String,
    /// Unprivileged `uid:gid` the script runs as
    pub user: String,
    /// How long a container may take to stop before it is killed
    pub stop_grace: Duration,
    /// Request timeout for runtime API calls, in seconds
    pub request_timeout_secs: u64,
    /// Disable network access in job containers
    pub network_disabled: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            url: "unix:///var/run/docker.sock".to_string(),
            image: "alpine".to_string(),
            user: "10000:10000".to_string(),
            stop_grace: Duration::from_secs(10),
            request_timeout_secs: 120,
            network_disabled: true,
        }
    }
}

/// Thresholds used by admission control.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Maximum CPU usage fraction
    pub max_cpu_usage: f64,
    /// Maximum memory usage fraction, including the next job's budget
    pub max_memory_usage: f64,
    /// Maximum disk usage fraction of the jobs directory
    pub max_disk_usage: f64,
    /// Maximum number of running jobs
    pub max_running_jobs: usize,
    /// Gap between the two CPU counter samples
    pub cpu_sample_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_cpu_usage: 0.8,
            max_memory_usage: 0.8,
            max_disk_usage: 0.8,
            max_running_jobs: 16,
            cpu_sample_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between two consume iterations
    pub iteration_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            iteration_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-process topic, for local runs
    Memory,
    /// Kafka consumer (requires the `kafka` feature)
    Kafka,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    /// Bootstrap servers, `host:port` comma-separated
    pub servers: String,
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            servers: "localhost:9092".to_string(),
            topic: "jobs".to_string(),
            group_id: "job-workers".to_string(),
            client_id: "job-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-process job table, for local runs
    Memory,
    /// Postgres with the job stored procedures
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Connection URL for the Postgres store
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Largest results blob the store accepts
    pub results_size_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            url: "postgres://localhost/Jobs".to_string(),
            max_connections: 4,
            acquire_timeout: Duration::from_secs(5),
            results_size_limit: DEFAULT_RESULTS_SIZE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub sandbox: SandboxConfig,
    pub docker: DockerConfig,
    pub admission: AdmissionConfig,
    pub consumer: ConsumerConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    /// Address of the read-only status endpoint; disabled when unset
    pub status_addr: Option<SocketAddr>,
}

impl WorkerConfig {
    pub fn with_jobs_directory(mut self, jobs_directory: impl Into<PathBuf>) -> Self {
        self.sandbox.jobs_directory = jobs_directory.into();
        self
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.jobs_directory, PathBuf::from("/tmp/jobs"));
        assert_eq!(cfg.cpu_limit, 0.5);
        assert_eq!(cfg.memory_limit_mb, 512);
        assert!(cfg.definition_template.is_none());
    }

    #[test]
    fn sandbox_limits_in_runtime_units() {
        let cfg = SandboxConfig {
            cpu_limit: 1.5,
            memory_limit_mb: 256,
            ..Default::default()
        };
        assert_eq!(cfg.nano_cpus(), 1_500_000_000);
        assert_eq!(cfg.memory_limit_bytes(), 256 * 1024 * 1024);
    }

    #[test]
    fn docker_config_default() {
        let cfg = DockerConfig::default();
        assert_eq!(cfg.url, "unix:///var/run/docker.sock");
        assert_eq!(cfg.image, "alpine");
        assert_eq!(cfg.user, "10000:10000");
        assert_eq!(cfg.stop_grace, Duration::from_secs(10));
        assert!(cfg.network_disabled);
    }

    #[test]
    fn admission_config_default() {
        let cfg = AdmissionConfig::default();
        assert_eq!(cfg.max_cpu_usage, 0.8);
        assert_eq!(cfg.max_memory_usage, 0.8);
        assert_eq!(cfg.max_disk_usage, 0.8);
        assert_eq!(cfg.max_running_jobs, 16);
        assert_eq!(cfg.cpu_sample_interval, Duration::from_millis(500));
    }

    #[test]
    fn store_config_default() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.kind, StoreKind::Memory);
        assert_eq!(cfg.results_size_limit, 50 * 1024 * 1024);
    }

    #[test]
    fn worker_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = WorkerConfig::default()
            .with_jobs_directory("/var/lib/jobs")
            .with_status_addr(addr);
        assert_eq!(cfg.sandbox.jobs_directory, PathBuf::from("/var/lib/jobs"));
        assert_eq!(cfg.status_addr, Some(addr));
        assert_eq!(cfg.broker.kind, BrokerKind::Memory);
        assert_eq!(cfg.consumer.iteration_delay, Duration::from_secs(1));
    }
}
