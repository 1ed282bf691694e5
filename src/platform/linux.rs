#[cfg(target_os = "linux")]
use anyhow::{Context, Result};
#[cfg(target_os = "linux")]
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use crate::monitor::{ProcessInfo, ProcessTable, TerminateError};
#[cfg(target_os = "linux")]
use crate::platform::parse;

/// Process table backed by `/proc`
#[cfg(target_os = "linux")]
#[derive(Debug, Default)]
pub struct LinuxProcessTable;

#[cfg(target_os = "linux")]
impl ProcessTable for LinuxProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let entries = std::fs::read_dir("/proc").context("Failed to read /proc")?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            // The process may exit between read_dir and here; skip it quietly.
            if let Some(name) = process_name(&entry.path()) {
                processes.push(ProcessInfo::new(pid, name));
            }
        }

        Ok(processes)
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        super::unix_terminate(pid)
    }
}

/// Name of a process: executable basename when readable, else `comm`
#[cfg(target_os = "linux")]
fn process_name(proc_dir: &Path) -> Option<String> {
    if let Ok(exe) = std::fs::read_link(proc_dir.join("exe")) {
        if let Some(name) = exe.to_str().map(parse::executable_basename) {
            // Replaced binaries show up as "name (deleted)"
            let name = name.trim_end_matches(" (deleted)");
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    let comm = std::fs::read_to_string(proc_dir.join("comm")).ok()?;
    let comm = comm.trim();
    (!comm.is_empty()).then(|| comm.to_string())
}

/// Installed applications from freedesktop `.desktop` entries
#[cfg(target_os = "linux")]
pub fn installed_apps() -> Result<Vec<String>> {
    let mut dirs = vec![
        PathBuf::from("/usr/share/applications"),
        PathBuf::from("/usr/local/share/applications"),
        PathBuf::from("/var/lib/flatpak/exports/share/applications"),
    ];
    if let Some(base) = directories::BaseDirs::new() {
        dirs.push(base.data_local_dir().join("applications"));
    }

    let mut apps = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => apps.extend(parse::parse_desktop_entry(&content)),
                Err(e) => tracing::debug!("Skipping {}: {}", path.display(), e),
            }
        }
    }

    apps.sort();
    apps.dedup();
    Ok(apps)
}
