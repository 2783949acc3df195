//! Isolation profile: the resource and security ceiling every run executes under.
//!
//! A profile is built once from validated settings and then shared read-only
//! (`Arc<IsolationProfile>`) across all concurrent runs. Nothing mutates it.
//! The only per-request input, the host path of the staged submission, is
//! attached by [`IsolationProfile::bind_source`], which produces a
//! [`BoundProfile`] owning its own copy of the profile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// How system calls are filtered inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallFilter {
    /// The container runtime's built-in default profile.
    RuntimeDefault,
    /// An explicit profile, as inline JSON.
    Profile(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationProfile {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub cpu_period_us: i64,
    pub cpu_quota_us: i64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
    pub syscall_filter: SyscallFilter,
    /// In-sandbox path of the read-only source mount.
    pub source_mount: PathBuf,
    /// Grace period between the stop signal and the runtime's own kill.
    pub stop_timeout: Duration,
}

impl IsolationProfile {
    /// Builds the profile from settings, validating them first. The stop grace
    /// period equals the execution deadline.
    pub fn from_settings(settings: &SandboxSettings) -> Result<Self, SandboxError> {
        settings.validate()?;

        let (cpu_period_us, cpu_quota_us) = settings.cpu.to_cfs();
        let syscall_filter = match &settings.seccomp_profile_json {
            Some(json) => SyscallFilter::Profile(json.clone()),
            None => SyscallFilter::RuntimeDefault,
        };

        Ok(Self {
            image: settings.image.clone(),
            command: settings.command.clone(),
            cpu_period_us,
            cpu_quota_us,
            memory_bytes: settings.memory_bytes,
            pids_limit: settings.pids_limit,
            network_disabled: settings.network_disabled,
            cap_drop: settings.cap_drop.clone(),
            no_new_privileges: settings.no_new_privileges,
            syscall_filter,
            source_mount: settings.source_mount.clone(),
            stop_timeout: Duration::from_secs(settings.exec_timeout_secs),
        })
    }

    /// Attaches the caller's staged file. The shared profile is left untouched.
    ///
    /// The host path must be absolute and free of the bind-spec separators
    /// `:` and `,`, otherwise a crafted path could smuggle extra mount options
    /// or a second host path into the bind.
    pub fn bind_source(&self, host_path: &Path) -> Result<BoundProfile, SandboxError> {
        if !host_path.is_absolute() {
            return Err(SandboxError::InvalidSubmission(format!(
                "staged source path must be absolute: {}",
                host_path.display()
            )));
        }
        let Some(host) = host_path.to_str() else {
            return Err(SandboxError::InvalidSubmission(
                "staged source path is not valid UTF-8".to_string(),
            ));
        };
        if host.contains(':') || host.contains(',') {
            return Err(SandboxError::InvalidSubmission(format!(
                "staged source path contains a bind separator: {}",
                host
            )));
        }

        Ok(BoundProfile {
            profile: self.clone(),
            source_host: host_path.to_path_buf(),
        })
    }

    /// Options for the runtime's `security_opt` list.
    pub fn security_opts(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.no_new_privileges {
            opts.push("no-new-privileges".to_string());
        }
        if let SyscallFilter::Profile(json) = &self.syscall_filter {
            opts.push(format!("seccomp={}", json));
        }
        opts
    }
}

/// A profile bound to one request's staged source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundProfile {
    profile: IsolationProfile,
    source_host: PathBuf,
}

impl BoundProfile {
    pub fn profile(&self) -> &IsolationProfile {
        &self.profile
    }

    pub fn source_host(&self) -> &Path {
        &self.source_host
    }

    /// The single bind this instance gets, `host:container:ro`.
    pub fn source_bind(&self) -> String {
        format!(
            "{}:{}:ro",
            self.source_host.display(),
            self.profile.source_mount.display()
        )
    }
}
