use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically write content to a file
///
/// Writes to a uniquely named temporary file in the same directory, syncs it
/// to disk, then renames it over the target. Concurrent writers never share
/// a temporary file, and readers only ever see the old or the new content.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Target path has no file name")?;
    let temp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    let written = (|| -> Result<()> {
        let mut file = File::create(&temp_path).with_context(|| {
            format!("Failed to create temporary file: {}", temp_path.display())
        })?;

        file.write_all(content)
            .context("Failed to write to temporary file")?;

        file.sync_all().context("Failed to sync file to disk")?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(())
}

/// Take an exclusive advisory lock guarding read-modify-write of `path`
///
/// The lock lives on a sibling `<name>.lock` file so that atomic renames of
/// `path` itself do not drop it. Released when the returned file is dropped.
pub fn lock_exclusive(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Target path has no file name")?;
    let lock_path = path.with_file_name(format!("{}.lock", file_name));

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock: {}", lock_path.display()))?;

    Ok(file)
}

/// Atomically write a file that holds secrets, restricting it to the owner
pub fn atomic_write_private(path: &Path, content: &[u8]) -> Result<()> {
    atomic_write(path, content)?;
    set_file_permissions(path, 0o600)
}

/// Ensure a directory exists, creating it and all parents if needed
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || path.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    set_file_permissions(path, 0o700)
}

/// Set file permissions to a specific mode (Unix only, no-op on Windows)
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_mode(mode);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}
