//! Core of the sandboxed code execution service.
//!
//! Each submitted program runs in a fresh, throwaway container under a fixed
//! isolation profile. The crate is organized around the stages of one run:
//!
//! - **Isolation profile**: the resource and security ceiling shared by every run
//! - **Runtime**: the container runtime seam, with a Docker implementation
//! - **Lifecycle**: create, start, stream and guaranteed removal of one instance
//! - **Capture**: demultiplexing the log stream into stdout and stderr
//! - **Supervision**: the wall-clock deadline and caller cancellation
//! - **Runner**: the façade tying the stages into one request/result call

pub mod capture;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod profile;
pub mod runner;
pub mod runtime;
pub mod supervisor;

pub use capture::{CapturedOutput, OutputCapture};
pub use config::*;
pub use errors::{ErrorClass, RuntimeError, SandboxError};
pub use lifecycle::{LifecycleManager, SandboxInstance, SandboxLease};
pub use profile::{BoundProfile, IsolationProfile};
pub use runner::{CodeRunner, ExecutionRequest, ExecutionResult, SandboxRunner};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use supervisor::{CompletionReason, DeadlineSupervisor};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
