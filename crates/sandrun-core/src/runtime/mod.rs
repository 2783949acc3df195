//! Isolation runtime boundary.
//!
//! The lifecycle manager drives containers only through [`ContainerRuntime`],
//! so the Docker client and the scripted test double are interchangeable.
//! Implementations must tolerate concurrent calls from many runs at once.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::errors::RuntimeError;
use crate::profile::BoundProfile;

/// One frame of a container's multiplexed log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

impl LogChunk {
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        LogChunk::Stdout(data.into())
    }

    pub fn stderr(data: impl Into<Bytes>) -> Self {
        LogChunk::Stderr(data.into())
    }
}

/// Live, order-preserving, channel-tagged output of one container.
/// Dropping it closes the underlying connection.
pub type LogStream = BoxStream<'static, Result<LogChunk, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container from the bound profile and returns its id.
    async fn create(&self, name: &str, profile: &BoundProfile) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Opens a following stream of stdout and stderr.
    async fn logs(&self, id: &str) -> Result<LogStream, RuntimeError>;

    /// Sends SIGKILL. A container that is already stopped or gone is not an error.
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-removes the container and its anonymous volumes. Removing a
    /// container that no longer exists is not an error.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

pub mod docker;

pub use docker::DockerRuntime;
