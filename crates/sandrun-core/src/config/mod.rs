//! Configuration module for the sandbox service
//!
//! Supports YAML configuration files with defaults for every field. A loaded
//! configuration is always validated, so the isolation profile built from it
//! never needs re-checking at request time.

pub mod types;
pub mod loader;

pub use types::*;
pub use loader::*;


use crate::errors::SandboxError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandrunConfig, SandboxError> {
    ConfigLoader::from_file(path).await
}
