//! Job consumption and execution.
//!
//! # Components
//!
//! - [`ConsumptionLoop`]: polls the broker while admission allows, hands jobs
//!   to the engine and commits offsets
//! - [`JobExecutionEngine`]: runs each admitted job as its own task and tracks
//!   the in-flight set
//! - [`SandboxEnvironment`]: per-job directory with the script and log files
//! - [`ContainerProcessRunner`]: runs the script in a container bounded by the
//!   job timeout
//! - [`ResultsArchiver`]: zips the log files into the job results
//!
//! # Execution Flow
//!
//! 1. Admission check, then one message is consumed
//! 2. The job is fetched from the store and handed to the engine
//! 3. The store marks the job running and the offset is committed
//! 4. In the background: prepare → run → collect → store results → clear

pub mod archive;
pub mod consumer;
pub mod container;
pub mod engine;
pub mod sandbox;

pub use archive::ResultsArchiver;
pub use consumer::{ConsumeOutcome, ConsumerWorker, ConsumptionLoop};
pub use container::ContainerProcessRunner;
pub use engine::{JobExecutionEngine, TrackedJob};
pub use sandbox::SandboxEnvironment;
