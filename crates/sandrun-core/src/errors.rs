//! Error types for the sandboxed execution pipeline
//!
//! Two layers are kept apart. `RuntimeError` is whatever the isolation runtime
//! (Docker, or a test double) reports. `SandboxError` is what a run reports to
//! its caller, and it always names the pipeline stage that failed together with
//! the container it failed on. Callers outside the core only ever see the
//! coarse `ErrorClass` so infrastructure detail does not leak past the façade.

use thiserror::Error;

/// Errors raised by the isolation runtime client.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}

impl RuntimeError {
    /// True when the runtime reports the target as already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            RuntimeError::NotFound(_) => true,
            RuntimeError::Bollard(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }

    /// True when the runtime refused because the container is not running.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RuntimeError::Bollard(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            })
        )
    }
}

/// Errors surfaced by a sandboxed run.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),
    #[error("Submission of {size} bytes exceeds the {limit} byte limit")]
    SubmissionTooLarge { size: u64, limit: u64 },
    #[error("Failed to create sandbox container: {source}")]
    CreateFailed {
        #[source]
        source: RuntimeError,
    },
    #[error("Failed to start container {id}: {source}")]
    StartFailed {
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Log stream unavailable for container {id}: {source}")]
    StreamUnavailable {
        id: String,
        #[source]
        source: RuntimeError,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Caller-visible classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The submission itself is at fault; resubmitting it unchanged will not help.
    BadRequest,
    /// Anything else. Details stay in the logs.
    InternalFailure,
}

impl SandboxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SandboxError::InvalidSubmission(_) | SandboxError::SubmissionTooLarge { .. } => {
                ErrorClass::BadRequest
            }
            SandboxError::CreateFailed { .. }
            | SandboxError::StartFailed { .. }
            | SandboxError::StreamUnavailable { .. }
            | SandboxError::Config(_)
            | SandboxError::Io(_)
            | SandboxError::Internal(_) => ErrorClass::InternalFailure,
        }
    }

    /// Container the failure is attributed to, when one was created.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            SandboxError::StartFailed { id, .. } | SandboxError::StreamUnavailable { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }
}
