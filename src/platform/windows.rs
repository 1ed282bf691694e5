#[cfg(target_os = "windows")]
use anyhow::{Context, Result};
#[cfg(target_os = "windows")]
use std::process::Command;

#[cfg(target_os = "windows")]
use winreg::enums::*;
#[cfg(target_os = "windows")]
use winreg::RegKey;

#[cfg(target_os = "windows")]
use crate::monitor::{ProcessInfo, ProcessTable, TerminateError};
#[cfg(target_os = "windows")]
use crate::platform::parse;

/// Uninstall keys scanned for installed applications
#[cfg(target_os = "windows")]
const UNINSTALL_KEYS: &[(&str, &str)] = &[
    ("HKLM", r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall"),
    ("HKLM", r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall"),
    ("HKCU", r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall"),
];

/// Process table backed by `tasklist` and `TerminateProcess`
#[cfg(target_os = "windows")]
#[derive(Debug, Default)]
pub struct WindowsProcessTable;

#[cfg(target_os = "windows")]
impl ProcessTable for WindowsProcessTable {
    fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let output = Command::new("tasklist")
            .args(["/FO", "CSV", "/NH"])
            .output()
            .context("Failed to run tasklist")?;

        if !output.status.success() {
            anyhow::bail!("tasklist exited with {}", output.status);
        }

        Ok(parse::parse_tasklist_csv(&String::from_utf8_lossy(&output.stdout)))
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        use windows_sys::Win32::Foundation::{
            CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER,
        };
        use windows_sys::Win32::System::Threading::{
            OpenProcess, TerminateProcess, PROCESS_TERMINATE,
        };

        // SAFETY: plain Win32 calls; the handle is closed on every path.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(match GetLastError() {
                    ERROR_INVALID_PARAMETER => TerminateError::NotFound(pid),
                    ERROR_ACCESS_DENIED => TerminateError::AccessDenied(pid),
                    code => TerminateError::Other(anyhow::anyhow!(
                        "OpenProcess({}) failed with error {}",
                        pid,
                        code
                    )),
                });
            }

            let terminated = TerminateProcess(handle, 1);
            let error = GetLastError();
            CloseHandle(handle);

            if terminated == 0 {
                return Err(match error {
                    ERROR_ACCESS_DENIED => TerminateError::AccessDenied(pid),
                    code => TerminateError::Other(anyhow::anyhow!(
                        "TerminateProcess({}) failed with error {}",
                        pid,
                        code
                    )),
                });
            }
        }

        Ok(())
    }
}

/// Installed applications from the uninstall registry keys
#[cfg(target_os = "windows")]
pub fn installed_apps() -> Result<Vec<String>> {
    let mut apps = Vec::new();

    for (hive, key_path) in UNINSTALL_KEYS {
        let root = match *hive {
            "HKCU" => RegKey::predef(HKEY_CURRENT_USER),
            _ => RegKey::predef(HKEY_LOCAL_MACHINE),
        };

        let key = match root.open_subkey(key_path) {
            Ok(key) => key,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!("Failed to open {}\\{}: {}", hive, key_path, e);
                continue;
            }
        };

        for sub_key in key.enum_keys().flatten() {
            let Ok(app_key) = key.open_subkey(&sub_key) else {
                continue;
            };
            if let Ok(name) = app_key.get_value::<String, _>("DisplayName") {
                if !name.trim().is_empty() {
                    apps.push(name.trim().to_string());
                }
            }
        }
    }

    apps.sort();
    apps.dedup();
    Ok(apps)
}
