//! Container runtime abstraction.

pub mod docker;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Container {0} was not started")]
    NotStarted(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Everything needed to create one job container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `uid:gid`
    pub user: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub nano_cpus: i64,
    pub memory_bytes: i64,
    /// `host:container[:ro]`
    pub binds: Vec<String>,
    pub network_disabled: bool,
    pub read_only_rootfs: bool,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer, ContainerError>;

    /// Returns false when the runtime reports the container was not started.
    async fn start(&self, container: &str) -> Result<bool, ContainerError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, container: &str) -> Result<i64, ContainerError>;

    async fn stop(&self, container: &str, grace: Duration) -> Result<(), ContainerError>;

    /// Force-removes the container.
    async fn remove(&self, container: &str) -> Result<(), ContainerError>;
}
