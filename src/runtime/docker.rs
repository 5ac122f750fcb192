use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;

use super::{ContainerError, ContainerRuntime, ContainerSpec, CreatedContainer};
use crate::config::DockerConfig;

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

impl DockerRuntime {
    pub fn connect(config: &DockerConfig) -> Result<Self, ContainerError> {
        let docker = if let Some(path) = config.url.strip_prefix("unix://") {
            Docker::connect_with_unix(path, config.request_timeout_secs, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(&config.url, config.request_timeout_secs, API_DEFAULT_VERSION)?
        };
        tracing::info!(url = %config.url, "Docker client configured");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer, ContainerError> {
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let config = Config {
            image: Some(spec.image.clone()),
            user: Some(spec.user.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            cmd: Some(spec.cmd.clone()),
            host_config: Some(HostConfig {
                nano_cpus: Some(spec.nano_cpus),
                memory: Some(spec.memory_bytes),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::NO),
                    maximum_retry_count: None,
                }),
                binds: Some(spec.binds.clone()),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                readonly_rootfs: Some(spec.read_only_rootfs),
                cap_drop: Some(spec.cap_drop.clone()),
                security_opt: Some(spec.security_opt.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn start(&self, container: &str) -> Result<bool, ContainerError> {
        match self
            .docker
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(true),
            // 304: container already started by someone else
            Err(e) if status_code(&e) == Some(304) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&self, container: &str) -> Result<i64, ContainerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit code as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(ContainerError::Runtime(format!(
                "wait stream for container {container} ended without a result"
            ))),
        }
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: never created
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container: &str) -> Result<(), ContainerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
