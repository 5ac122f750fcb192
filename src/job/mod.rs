pub mod model;

pub use model::{JobDefinition, JobStatus, RunningJob};
