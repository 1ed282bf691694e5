#[cfg(target_os = "macos")]
use anyhow::{Context, Result};
#[cfg(target_os = "macos")]
use std::path::Path;
#[cfg(target_os = "macos")]
use std::process::Command;

#[cfg(target_os = "macos")]
use plist::Value;

#[cfg(target_os = "macos")]
use crate::monitor::{ProcessInfo, ProcessTable, TerminateError};
#[cfg(target_os = "macos")]
use crate::platform::parse;

/// Process table backed by `ps`
#[cfg(target_os = "macos")]
#[derive(Debug, Default)]
pub struct MacProcessTable;

#[cfg(target_os = "macos")]
impl ProcessTable for MacProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,comm="])
            .output()
            .context("Failed to run ps")?;

        if !output.status.success() {
            anyhow::bail!("ps exited with {}", output.status);
        }

        Ok(parse::parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        super::unix_terminate(pid)
    }
}

/// Installed application bundles in the system and user Applications folders
#[cfg(target_os = "macos")]
pub fn installed_apps() -> Result<Vec<String>> {
    let mut dirs = vec![std::path::PathBuf::from("/Applications")];
    if let Some(base) = directories::BaseDirs::new() {
        dirs.push(base.home_dir().join("Applications"));
    }

    let mut apps = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("app") {
                continue;
            }
            if let Some(name) = bundle_name(&path) {
                apps.push(name);
            }
        }
    }

    apps.sort();
    apps.dedup();
    Ok(apps)
}

/// Display name of an app bundle, falling back to the bundle directory name
#[cfg(target_os = "macos")]
fn bundle_name(bundle: &Path) -> Option<String> {
    let info_plist = bundle.join("Contents").join("Info.plist");

    if let Ok(Value::Dictionary(dict)) = plist::from_file::<_, Value>(&info_plist) {
        for key in ["CFBundleDisplayName", "CFBundleName"] {
            if let Some(name) = dict.get(key).and_then(|v| v.as_string()) {
                if !name.trim().is_empty() {
                    return Some(name.trim().to_string());
                }
            }
        }
    }

    bundle
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}
