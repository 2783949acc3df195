//! Configuration loader for YAML files
//!
//! Parses the YAML document, reads any files it references (the seccomp
//! profile) and validates the result before handing it out.

use crate::config::types::*;
use crate::errors::SandboxError;
use std::path::Path;
use tokio::fs;

/// Configuration loader with file resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandrunConfig, SandboxError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content, path.parent()).await
    }

    /// Load configuration from a YAML string. Relative paths inside the
    /// document resolve against `base_dir`.
    pub async fn from_str(
        content: &str,
        base_dir: Option<&Path>,
    ) -> Result<SandrunConfig, SandboxError> {
        let mut config: SandrunConfig = if content.trim().is_empty() {
            SandrunConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| SandboxError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::resolve_seccomp(&mut config.sandbox, base_dir).await?;

        config.validate()?;

        Ok(config)
    }

    /// Built-in defaults, validated the same way a file would be.
    pub fn defaults() -> Result<SandrunConfig, SandboxError> {
        let config = SandrunConfig::default();
        config.validate()?;
        Ok(config)
    }

    async fn resolve_seccomp(
        sandbox: &mut SandboxSettings,
        base_dir: Option<&Path>,
    ) -> Result<(), SandboxError> {
        let Some(profile_path) = &sandbox.seccomp_profile else {
            return Ok(());
        };

        let resolved = match base_dir {
            Some(dir) if profile_path.is_relative() => dir.join(profile_path),
            _ => profile_path.clone(),
        };

        let content = fs::read_to_string(&resolved).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read seccomp profile {}: {}",
                resolved.display(),
                e
            ))
        })?;

        // Docker expects the profile inline; reject garbage here rather than at container create.
        let parsed: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            SandboxError::Config(format!(
                "Seccomp profile {} is not valid JSON: {}",
                resolved.display(),
                e
            ))
        })?;
        if !parsed.is_object() {
            return Err(SandboxError::Config(format!(
                "Seccomp profile {} must be a JSON object",
                resolved.display()
            )));
        }

        log::info!("Loaded seccomp profile from {}", resolved.display());
        sandbox.seccomp_profile_json = Some(serde_json::to_string(&parsed).map_err(|e| {
            SandboxError::Config(format!("Failed to re-encode seccomp profile: {}", e))
        })?);

        Ok(())
    }
}
