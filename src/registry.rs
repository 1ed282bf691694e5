use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::state;

/// One protected application and whether it is currently locked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockEntry {
    pub app_identifier: String,
    pub locked: bool,
}

/// Persisted mapping from application identifier to lock state
///
/// The registry is the single in-process owner of `registry.json`. Every
/// mutation re-reads the file under an exclusive file lock, persists the new
/// map with an atomic rename and only then publishes it, so readers (the
/// monitor) never observe a partial update and an edit made by another
/// process in the meantime is never overwritten.
pub struct LockRegistry {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, bool>>,
}

impl LockRegistry {
    /// Open the registry at `path`
    ///
    /// A missing file is an empty registry and a corrupt file is treated as
    /// empty (fail open). Being unable to read the file or create its
    /// directory at all is a startup error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            crate::platform::common::ensure_directory_exists(parent).with_context(|| {
                format!("Failed to prepare registry directory: {}", parent.display())
            })?;
        }

        let entries = match read_entries(&path)? {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Lock registry is corrupt, treating as empty: {:#}", e);
                BTreeMap::new()
            }
        };

        info!(
            "Opened lock registry at {} ({} entries)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the lock state of an application, adding it if needed
    pub fn set_locked(&self, app_id: &str, locked: bool) -> Result<()> {
        self.update(|entries| {
            entries.insert(app_id.to_string(), locked);
            true
        })?;
        debug!("Registry: {} -> locked={}", app_id, locked);
        Ok(())
    }

    /// Lock an application only if it is still protected
    ///
    /// Used by re-lock timers so that an entry removed in the meantime is not
    /// resurrected. Returns whether the entry was present.
    pub fn relock_if_present(&self, app_id: &str) -> Result<bool> {
        self.update(|entries| match entries.get_mut(app_id) {
            Some(locked) if !*locked => {
                *locked = true;
                true
            }
            _ => false,
        })?;
        Ok(self.contains(app_id))
    }

    /// Stop protecting an application. Returns whether it was present.
    pub fn remove(&self, app_id: &str) -> Result<bool> {
        self.update(|entries| entries.remove(app_id).is_some())
    }

    /// Whether an application is locked; unknown applications are not
    pub fn is_locked(&self, app_id: &str) -> bool {
        self.read().get(app_id).copied().unwrap_or(false)
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.read().contains_key(app_id)
    }

    /// Identifiers of all currently locked applications
    pub fn list_locked(&self) -> BTreeSet<String> {
        self.read()
            .iter()
            .filter(|(_, locked)| **locked)
            .map(|(app, _)| app.clone())
            .collect()
    }

    /// Snapshot of every entry, sorted by identifier
    pub fn entries(&self) -> Vec<LockEntry> {
        self.read()
            .iter()
            .map(|(app, locked)| LockEntry {
                app_identifier: app.clone(),
                locked: *locked,
            })
            .collect()
    }

    /// Re-read the backing file to pick up edits made by another process
    ///
    /// Never fails: a corrupt file is treated as empty and an unreadable file
    /// leaves the current view in place.
    pub fn reload(&self) {
        let fresh = match read_entries(&self.path) {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!("Lock registry is corrupt, treating as empty: {:#}", e);
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Could not reload lock registry, keeping current state: {:#}", e);
                return;
            }
        };

        let mut entries = self.write();
        if *entries != fresh {
            debug!("Lock registry changed on disk ({} entries)", fresh.len());
            *entries = fresh;
        }
    }

    /// Read-modify-persist-publish under the write lock
    ///
    /// Other processes (the CLI and the daemon) write the same file, so the
    /// map is re-read from disk while holding an exclusive file lock and
    /// `mutate` applies to that fresh copy, never to the cached view.
    /// `mutate` returns whether it changed anything; unchanged maps are not
    /// rewritten.
    fn update<F>(&self, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeMap<String, bool>) -> bool,
    {
        let mut entries = self.write();
        let _file_lock = crate::platform::common::lock_exclusive(&self.path)
            .context("Failed to lock registry file")?;

        let mut next = match read_entries(&self.path)? {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Lock registry is corrupt, rewriting from scratch: {:#}", e);
                BTreeMap::new()
            }
        };

        let changed = mutate(&mut next);
        if changed {
            state::save_json(&self.path, &next).context("Failed to persist lock registry")?;
        }

        *entries = next;
        Ok(changed)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, bool>> {
        // A panic while holding the lock cannot leave a half-applied map
        // because maps are swapped whole.
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, bool>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Outer error: the file could not be read. Inner error: it could be read but
/// not parsed.
fn read_entries(path: &Path) -> Result<Result<BTreeMap<String, bool>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ok(BTreeMap::new())),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read lock registry: {}", path.display()));
        }
    };

    Ok(serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse lock registry: {}", path.display())))
}
