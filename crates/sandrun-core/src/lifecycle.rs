//! Container lifecycle management.
//!
//! `LifecycleManager` creates, starts, streams and removes one container per
//! run through the injected [`ContainerRuntime`]. The instance it hands out is
//! owned by exactly one run. [`SandboxLease`] is the compensating action for
//! a created container: the run calls [`SandboxLease::release`] on every exit
//! path, and if the run's future is dropped before that happens the lease
//! schedules the removal itself.

use std::fmt;
use std::sync::Arc;

use crate::errors::SandboxError;
use crate::profile::BoundProfile;
use crate::runtime::{ContainerRuntime, LogStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Exited,
    Removed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Created => "created",
            InstanceState::Running => "running",
            InstanceState::Exited => "exited",
            InstanceState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// One live container.
#[derive(Debug)]
pub struct SandboxInstance {
    id: String,
    name: String,
    state: InstanceState,
}

impl SandboxInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Records that the program finished on its own.
    pub fn mark_exited(&mut self) {
        if self.state == InstanceState::Running {
            self.state = InstanceState::Exited;
        }
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn create(
        &self,
        name: &str,
        profile: &BoundProfile,
    ) -> Result<SandboxInstance, SandboxError> {
        let id = self.runtime.create(name, profile).await.map_err(|source| {
            log::error!("name={} create failed: {}", name, source);
            SandboxError::CreateFailed { source }
        })?;

        log::info!("container={} created name={}", id, name);
        Ok(SandboxInstance {
            id,
            name: name.to_string(),
            state: InstanceState::Created,
        })
    }

    /// Starts the container. On failure the instance is removed before the
    /// error is returned, so no created-but-unstarted container survives.
    pub async fn start(&self, instance: &mut SandboxInstance) -> Result<(), SandboxError> {
        if instance.state != InstanceState::Created {
            return Err(SandboxError::Internal(format!(
                "container {} cannot start from state {}",
                instance.id, instance.state
            )));
        }

        match self.runtime.start(&instance.id).await {
            Ok(()) => {
                instance.state = InstanceState::Running;
                log::info!("container={} started", instance.id);
                Ok(())
            }
            Err(source) => {
                log::error!("container={} start failed: {}", instance.id, source);
                self.remove(instance).await;
                Err(SandboxError::StartFailed {
                    id: instance.id.clone(),
                    source,
                })
            }
        }
    }

    /// Opens the multiplexed stdout/stderr stream. Not retried: a missing
    /// stream is an infrastructure fault.
    pub async fn stream_logs(&self, instance: &SandboxInstance) -> Result<LogStream, SandboxError> {
        if instance.state != InstanceState::Running {
            return Err(SandboxError::StreamUnavailable {
                id: instance.id.clone(),
                source: crate::errors::RuntimeError::NotFound(format!(
                    "{} is {}",
                    instance.id, instance.state
                )),
            });
        }

        match self.runtime.logs(&instance.id).await {
            Ok(stream) => {
                log::debug!("container={} log stream opened", instance.id);
                Ok(stream)
            }
            Err(source) => {
                log::error!("container={} log stream unavailable: {}", instance.id, source);
                Err(SandboxError::StreamUnavailable {
                    id: instance.id.clone(),
                    source,
                })
            }
        }
    }

    /// Kills and force-removes the container. Best effort and idempotent:
    /// failures are logged, never returned, and a removed instance is left alone.
    pub async fn remove(&self, instance: &mut SandboxInstance) {
        if instance.state == InstanceState::Removed {
            log::debug!("container={} already removed", instance.id);
            return;
        }

        remove_by_id(self.runtime.as_ref(), &instance.id).await;
        instance.state = InstanceState::Removed;
    }
}

async fn remove_by_id(runtime: &dyn ContainerRuntime, id: &str) {
    if let Err(e) = runtime.kill(id).await {
        log::warn!("container={} kill failed: {}", id, e);
    }
    match runtime.remove(id).await {
        Ok(()) => log::info!("container={} removed", id),
        Err(e) => log::warn!("container={} removal failed: {}", id, e),
    }
}

/// Ownership of a created container until its removal has been issued.
pub struct SandboxLease {
    manager: LifecycleManager,
    instance: Option<SandboxInstance>,
}

impl SandboxLease {
    pub fn new(manager: LifecycleManager, instance: SandboxInstance) -> Self {
        Self {
            manager,
            instance: Some(instance),
        }
    }

    pub fn instance(&self) -> &SandboxInstance {
        self.instance
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease is only emptied by release or drop"))
    }

    pub fn instance_mut(&mut self) -> &mut SandboxInstance {
        self.instance
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease is only emptied by release or drop"))
    }

    pub fn id(&self) -> &str {
        self.instance().id()
    }

    /// Issues removal (unless already done) and returns the removed instance.
    ///
    /// The instance stays in the lease until removal has returned, so if this
    /// future is dropped part way the `Drop` backstop still sees it.
    pub async fn release(mut self) -> SandboxInstance {
        if let Some(instance) = self.instance.as_mut() {
            self.manager.remove(instance).await;
        }
        self.instance
            .take()
            .unwrap_or_else(|| unreachable!("lease is only emptied by release or drop"))
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        if instance.state == InstanceState::Removed {
            return;
        }

        log::warn!(
            "container={} lease dropped before release, scheduling removal",
            instance.id
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.manager.runtime.clone();
                handle.spawn(async move {
                    remove_by_id(runtime.as_ref(), &instance.id).await;
                });
            }
            Err(_) => log::error!(
                "container={} leaked: no async runtime available for removal",
                instance.id
            ),
        }
    }
}
