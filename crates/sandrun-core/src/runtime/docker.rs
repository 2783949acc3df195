// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput; // For LogOutput::StdOut, LogOutput::StdErr
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

use super::{ContainerRuntime, LogChunk, LogStream};
use crate::errors::RuntimeError;
use crate::profile::BoundProfile;

pub const MANAGED_LABEL: &str = "sandrun.managed";

/// Docker-backed runtime. The wrapped client is cheap to clone and pools its
/// connections, so one instance serves every concurrent run.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the local defaults (`DOCKER_HOST` or the unix socket),
    /// with `request_timeout` bounding every API call.
    pub fn connect(request_timeout: Duration) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?.with_timeout(request_timeout);
        Ok(Self { docker })
    }

    /// Checks the daemon answers and the image is present, pulling it when missing.
    pub async fn preflight(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        log::info!("Docker daemon reachable");

        match self.docker.inspect_image(image).await.map_err(RuntimeError::from) {
            Ok(_) => {
                log::info!("Sandbox image {} present", image);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                log::warn!("Sandbox image {} not found locally, pulling", image);
                let options = Some(BollardCreateImageOptionsQuery {
                    from_image: Some(image.to_string()),
                    ..Default::default()
                });
                self.docker
                    .create_image(options, None, None)
                    .try_collect::<Vec<_>>()
                    .await?;
                log::info!("Pulled sandbox image {}", image);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Translates a bound profile into the create request. Exactly one bind is
/// emitted: the caller's source, read-only.
pub fn container_body(bound: &BoundProfile) -> ContainerCreateBody {
    let profile = bound.profile();
    let security_opt = profile.security_opts();

    ContainerCreateBody {
        image: Some(profile.image.clone()),
        cmd: profile.command.clone(),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(profile.network_disabled),
        stop_timeout: Some(profile.stop_timeout.as_secs() as i64),
        labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
        host_config: Some(HostConfig {
            binds: Some(vec![bound.source_bind()]),
            cap_drop: Some(profile.cap_drop.clone()),
            security_opt: if security_opt.is_empty() { None } else { Some(security_opt) },
            cpu_period: Some(profile.cpu_period_us),
            cpu_quota: Some(profile.cpu_quota_us),
            memory: Some(profile.memory_bytes),
            // Same value as memory: no swap on top of the ceiling.
            memory_swap: Some(profile.memory_bytes),
            pids_limit: Some(profile.pids_limit),
            network_mode: if profile.network_disabled { Some("none".to_string()) } else { None },
            // Removal is ours to issue; logs must outlive the process.
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn map_log_output(output: LogOutput) -> Option<LogChunk> {
    match output {
        // Console frames only appear for tty containers, where both channels are merged.
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some(LogChunk::Stdout(message))
        }
        LogOutput::StdErr { message } => Some(LogChunk::Stderr(message)),
        LogOutput::StdIn { .. } => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, name: &str, profile: &BoundProfile) -> Result<String, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(name.to_string()),
            ..Default::default()
        });

        let created = self
            .docker
            .create_container(options, container_body(profile))
            .await?;
        for warning in &created.warnings {
            log::warn!("container={} create warning: {}", created.id, warning);
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError> {
        // The log request itself is lazy; confirm the container exists up front
        // so a missing instance fails here instead of mid-capture.
        self.docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await
            .map_err(|e| match RuntimeError::from(e) {
                err if err.is_not_found() => RuntimeError::NotFound(id.to_string()),
                err => err,
            })?;

        let options = Some(BollardLogsOptionsQuery {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        });

        let stream = self
            .docker
            .logs(id, options)
            .filter_map(|item| async move {
                match item {
                    Ok(output) => map_log_output(output).map(Ok),
                    Err(e) => Some(Err(RuntimeError::from(e))),
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let options = Some(BollardKillContainerOptionsQuery {
            signal: "SIGKILL".to_string(),
            ..Default::default()
        });
        match self.docker.kill_container(id, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() || err.is_conflict() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = RuntimeError::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
