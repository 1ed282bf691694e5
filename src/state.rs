use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Locations of the persisted state files inside the data directory
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Application identifier -> locked
    pub fn registry(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// TOTP secret, identity and legacy PIN hash
    pub fn credential(&self) -> PathBuf {
        self.root.join("credential.json")
    }

    pub fn recovery_keys(&self) -> PathBuf {
        self.root.join("recovery_keys.json")
    }

    pub fn reset_requests(&self) -> PathBuf {
        self.root.join("reset_requests.json")
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join("leases.json")
    }

    /// Recent failed authentication attempts, shared by every process
    pub fn auth_failures(&self) -> PathBuf {
        self.root.join("auth_failures.json")
    }
}

/// Load a JSON state file
///
/// Returns `Ok(None)` if the file does not exist. Read and parse failures are
/// errors; each caller decides whether that fails open or closed.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read state file: {}", path.display()));
        }
    };

    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

    Ok(Some(value))
}

/// Load a JSON state file, treating a corrupt file as absent
///
/// Only read failures are errors. A file that cannot be parsed is logged and
/// reported as `Ok(None)`.
pub fn load_json_or_discard<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read state file: {}", path.display()));
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("{} at {} is corrupt, ignoring it: {}", what, path.display(), e);
            Ok(None)
        }
    }
}

/// Save a JSON state file atomically
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize state")?;

    crate::platform::common::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write state file: {}", path.display()))
}

/// Save a JSON state file that contains secrets (owner-only on Unix)
pub fn save_json_private<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize state")?;

    crate::platform::common::atomic_write_private(path, content.as_bytes())
        .with_context(|| format!("Failed to write state file: {}", path.display()))
}
