//! Configuration type definitions for the sandbox service
//!
//! Every field carries a serde default, so an empty YAML document (or no file
//! at all) yields the stock policy: a quarter of one core, 100 MB of memory,
//! 100 processes, no network, no capabilities and a 30 second deadline.
//! `validate` is the single gate a configuration passes through before an
//! `IsolationProfile` is built from it.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use crate::errors::SandboxError;

/// Smallest memory ceiling the Docker daemon accepts.
pub const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;
/// CFS bounds enforced by the kernel, in microseconds.
pub const MIN_CPU_PERIOD_US: i64 = 1_000;
pub const MAX_CPU_PERIOD_US: i64 = 1_000_000;
pub const MIN_CPU_QUOTA_US: i64 = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandrunConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Directory of static frontend assets served under `/`.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    /// Ceiling on the whole multipart request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_image")]
    pub image: String,
    /// Overrides the image's CMD when set.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Fixed in-sandbox path the submission is mounted at, read-only.
    #[serde(default = "default_source_mount")]
    pub source_mount: PathBuf,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: u64,
    /// Per channel.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub cpu: CpuLimit,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_true")]
    pub network_disabled: bool,
    #[serde(default = "default_cap_drop")]
    pub cap_drop: Vec<String>,
    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
    /// Path to a JSON seccomp profile. The runtime's default profile applies when unset.
    #[serde(default)]
    pub seccomp_profile: Option<PathBuf>,
    /// Contents of `seccomp_profile`, filled in by the loader.
    #[serde(skip)]
    pub seccomp_profile_json: Option<String>,
}

/// CPU ceiling, either as raw CFS values or as a share of one core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CpuLimit {
    Percent { percent: u32 },
    Quota { period_us: i64, quota_us: i64 },
}

impl Default for CpuLimit {
    fn default() -> Self {
        CpuLimit::Quota {
            period_us: 25_000,
            quota_us: 6_250,
        }
    }
}

impl CpuLimit {
    /// Resolves to `(period_us, quota_us)`.
    pub fn to_cfs(self) -> (i64, i64) {
        match self {
            CpuLimit::Quota { period_us, quota_us } => (period_us, quota_us),
            CpuLimit::Percent { percent } => {
                let period = 100_000;
                (period, period * i64::from(percent) / 100)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Timeout applied by the Docker client to every API call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            static_dir: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: None,
            source_mount: default_source_mount(),
            exec_timeout_secs: default_exec_timeout_secs(),
            max_source_bytes: default_max_source_bytes(),
            max_output_bytes: default_max_output_bytes(),
            cpu: CpuLimit::default(),
            memory_bytes: default_memory_bytes(),
            pids_limit: default_pids_limit(),
            network_disabled: true,
            cap_drop: default_cap_drop(),
            no_new_privileges: true,
            seccomp_profile: None,
            seccomp_profile_json: None,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SandrunConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        self.sandbox.validate()?;

        if self.server.max_body_bytes == 0 {
            return Err(SandboxError::Config("server.max_body_bytes must be greater than 0".to_string()));
        }
        if (self.server.max_body_bytes as u64) < self.sandbox.max_source_bytes {
            return Err(SandboxError::Config(format!(
                "server.max_body_bytes ({}) cannot be smaller than sandbox.max_source_bytes ({})",
                self.server.max_body_bytes, self.sandbox.max_source_bytes
            )));
        }
        if self.runtime.request_timeout_secs == 0 {
            return Err(SandboxError::Config("runtime.request_timeout_secs must be greater than 0".to_string()));
        }

        Ok(())
    }
}

impl SandboxSettings {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::Config("sandbox.image cannot be empty".to_string()));
        }
        if let Some(command) = &self.command {
            if command.is_empty() {
                return Err(SandboxError::Config("sandbox.command cannot be an empty list".to_string()));
            }
        }

        if !self.source_mount.is_absolute() || self.source_mount.parent().is_none() {
            return Err(SandboxError::Config(format!(
                "sandbox.source_mount must be an absolute file path, got '{}'",
                self.source_mount.display()
            )));
        }
        let mount = self.source_mount.to_string_lossy();
        if mount.contains(':') || mount.contains(',') {
            return Err(SandboxError::Config(format!(
                "sandbox.source_mount cannot contain ':' or ',', got '{}'",
                mount
            )));
        }

        if self.exec_timeout_secs == 0 {
            return Err(SandboxError::Config("sandbox.exec_timeout_secs must be greater than 0".to_string()));
        }
        if self.max_source_bytes == 0 {
            return Err(SandboxError::Config("sandbox.max_source_bytes must be greater than 0".to_string()));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::Config("sandbox.max_output_bytes must be greater than 0".to_string()));
        }

        if let CpuLimit::Percent { percent } = self.cpu {
            if !(1..=100).contains(&percent) {
                return Err(SandboxError::Config(format!(
                    "sandbox.cpu.percent must be within 1..=100, got {}",
                    percent
                )));
            }
        }
        let (period, quota) = self.cpu.to_cfs();
        if !(MIN_CPU_PERIOD_US..=MAX_CPU_PERIOD_US).contains(&period) {
            return Err(SandboxError::Config(format!(
                "sandbox.cpu.period_us must be within {}..={}, got {}",
                MIN_CPU_PERIOD_US, MAX_CPU_PERIOD_US, period
            )));
        }
        if quota < MIN_CPU_QUOTA_US {
            return Err(SandboxError::Config(format!(
                "sandbox.cpu quota must be at least {}us, got {}",
                MIN_CPU_QUOTA_US, quota
            )));
        }
        if quota > period {
            return Err(SandboxError::Config(format!(
                "sandbox.cpu quota ({}us) exceeds one core for period {}us",
                quota, period
            )));
        }

        if self.memory_bytes < MIN_MEMORY_BYTES {
            return Err(SandboxError::Config(format!(
                "sandbox.memory_bytes must be at least {}, got {}",
                MIN_MEMORY_BYTES, self.memory_bytes
            )));
        }
        if self.pids_limit <= 0 {
            return Err(SandboxError::Config("sandbox.pids_limit must be greater than 0".to_string()));
        }

        if !self.network_disabled {
            return Err(SandboxError::Config(
                "sandbox.network_disabled cannot be turned off: sandboxed code never gets network access".to_string(),
            ));
        }
        if !self.cap_drop.iter().any(|cap| cap.eq_ignore_ascii_case("ALL")) {
            return Err(SandboxError::Config("sandbox.cap_drop must contain ALL".to_string()));
        }

        Ok(())
    }
}

fn default_bind_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 8080)) }
fn default_max_body_bytes() -> usize { 64 * 1024 }
fn default_image() -> String { "godwhoa/sandbox:latest".to_string() }
fn default_source_mount() -> PathBuf { PathBuf::from("/src/main.c") }
fn default_exec_timeout_secs() -> u64 { 30 }
fn default_max_source_bytes() -> u64 { 5_000 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_memory_bytes() -> i64 { 100_000_000 }
fn default_pids_limit() -> i64 { 100 }
fn default_cap_drop() -> Vec<String> { vec!["ALL".to_string()] }
fn default_request_timeout_secs() -> u64 { 120 }
fn default_true() -> bool { true }
