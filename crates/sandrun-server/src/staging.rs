//! Per-request staging of the submitted source on the host.
//!
//! Each submission gets its own temporary directory holding `main.c`. The
//! directory lives as long as the [`StagedSource`] and is deleted on drop, so
//! it must be kept alive until the run that mounts it has returned.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::Result;

const SOURCE_FILE_NAME: &str = "main.c";

#[derive(Debug)]
pub struct StagedSource {
    _dir: TempDir,
    path: PathBuf,
    size: u64,
}

impl StagedSource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Writes `source` into a fresh directory, world-readable so the sandbox
/// user can read it through the read-only mount.
pub async fn stage_source(source: &[u8]) -> Result<StagedSource> {
    let dir = tempfile::Builder::new().prefix("sandrun-").tempdir()?;
    let path = dir.path().join(SOURCE_FILE_NAME);

    tokio::fs::write(&path, source).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
    }

    log::debug!("staged {} bytes at {}", source.len(), path.display());
    Ok(StagedSource {
        _dir: dir,
        path,
        size: source.len() as u64,
    })
}
