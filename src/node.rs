use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{InMemoryBroker, JobConsumer};
use crate::config::{BrokerKind, StoreKind, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::job::JobDefinition;
use crate::resources::{
    AdmissionGate, LinuxResourceSampler, ResourceAdmissionController, ResourceSampler,
};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::status::{run_status_server, StatusState};
use crate::store::{InMemoryJobStore, JobStore, PostgresJobStore};
use crate::worker::{
    ConsumerWorker, ConsumptionLoop, ContainerProcessRunner, JobExecutionEngine, ResultsArchiver,
    SandboxEnvironment,
};

/// In-process broker and store, present when both run in memory.
#[derive(Clone)]
pub struct LocalQueue {
    pub store: Arc<InMemoryJobStore>,
    pub broker: Arc<InMemoryBroker>,
}

impl LocalQueue {
    /// Adds a New job for `script` and announces it on the topic.
    pub async fn submit(&self, script: &[u8], timeout: Duration) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.store
            .add_new(JobDefinition::new(id, timeout, STANDARD.encode(script)))
            .await?;
        self.broker.publish(id).await;
        tracing::info!(job_id = %id, "Job submitted to local queue");
        Ok(id)
    }
}

/// One worker process: consumption loop, execution engine and status endpoint.
pub struct WorkerNode {
    pub config: WorkerConfig,
    pub worker_id: String,
    pub engine: JobExecutionEngine,
    pub local: Option<LocalQueue>,
    consumer: Arc<dyn JobConsumer>,
    store: Arc<dyn JobStore>,
    admission: Arc<dyn AdmissionGate>,
}

impl WorkerNode {
    /// Connects the configured broker, store and container runtime.
    ///
    /// # Errors
    ///
    /// Fails if an adapter cannot be configured, e.g. the store is unreachable
    /// or Kafka is requested in a build without the `kafka` feature.
    pub async fn connect(config: WorkerConfig, worker_id: impl Into<String>) -> Result<Self> {
        let memory_store = Arc::new(InMemoryJobStore::with_results_limit(
            config.store.results_size_limit,
        ));
        let memory_broker = Arc::new(InMemoryBroker::new());

        let store: Arc<dyn JobStore> = match config.store.kind {
            StoreKind::Memory => memory_store.clone(),
            StoreKind::Postgres => Arc::new(PostgresJobStore::connect(&config.store).await?),
        };

        let consumer: Arc<dyn JobConsumer> = match config.broker.kind {
            BrokerKind::Memory => memory_broker.clone(),
            BrokerKind::Kafka => Self::kafka_consumer(&config)?,
        };

        let local = (config.store.kind == StoreKind::Memory
            && config.broker.kind == BrokerKind::Memory)
            .then(|| LocalQueue {
                store: memory_store,
                broker: memory_broker,
            });

        let runtime = Arc::new(DockerRuntime::connect(&config.docker)?);
        let sandbox = SandboxEnvironment::from_config(config.sandbox.clone()).await?;

        let mut node = Self::from_parts(
            config,
            worker_id,
            consumer,
            store,
            runtime,
            Arc::new(LinuxResourceSampler::new()),
            sandbox,
        );
        node.local = local;
        Ok(node)
    }

    /// Assembles a node from already constructed adapters.
    pub fn from_parts(
        config: WorkerConfig,
        worker_id: impl Into<String>,
        consumer: Arc<dyn JobConsumer>,
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        sampler: Arc<dyn ResourceSampler>,
        sandbox: SandboxEnvironment,
    ) -> Self {
        let runner = ContainerProcessRunner::new(runtime, config.docker.clone(), &config.sandbox);
        let engine =
            JobExecutionEngine::new(sandbox, runner, ResultsArchiver::new(), store.clone());
        let admission = Arc::new(ResourceAdmissionController::new(
            Arc::new(engine.clone()),
            sampler,
            config.admission.clone(),
            &config.sandbox,
        ));

        Self {
            config,
            worker_id: worker_id.into(),
            engine,
            local: None,
            consumer,
            store,
            admission,
        }
    }

    #[cfg(feature = "kafka")]
    fn kafka_consumer(config: &WorkerConfig) -> Result<Arc<dyn JobConsumer>> {
        Ok(Arc::new(crate::broker::KafkaJobConsumer::new(&config.broker)?))
    }

    #[cfg(not(feature = "kafka"))]
    fn kafka_consumer(_config: &WorkerConfig) -> Result<Arc<dyn JobConsumer>> {
        Err(WorkerError::Config(
            "Kafka broker requested but job-worker was built without the `kafka` feature"
                .to_string(),
        ))
    }

    /// Runs until `shutdown` is cancelled, then drains running jobs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            worker_id = %self.worker_id,
            jobs_directory = %self.config.sandbox.jobs_directory.display(),
            max_running_jobs = self.config.admission.max_running_jobs,
            "Starting worker"
        );

        tokio::fs::create_dir_all(&self.config.sandbox.jobs_directory)
            .await
            .map_err(|e| {
                WorkerError::Config(format!(
                    "cannot create jobs directory '{}': {e}",
                    self.config.sandbox.jobs_directory.display()
                ))
            })?;

        let status_task = self.config.status_addr.map(|addr| {
            let state = StatusState {
                engine: self.engine.clone(),
                max_running_jobs: self.config.admission.max_running_jobs,
                worker_id: self.worker_id.clone(),
            };
            tokio::spawn(run_status_server(addr, state, shutdown.clone()))
        });

        let worker = ConsumerWorker::new(
            self.consumer,
            self.store,
            self.engine,
            self.admission,
            self.config.consumer.clone(),
        );
        let consumption = ConsumptionLoop::start(worker)?;

        shutdown.cancelled().await;
        consumption.stop().await;

        if let Some(task) = status_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Status server task failed");
            }
        }
        Ok(())
    }
}
