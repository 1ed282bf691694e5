/// Platform-specific process control, application inventory and file helpers

pub mod common;
pub mod parse;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

use anyhow::Result;
use std::sync::Arc;

use crate::monitor::ProcessTable;
#[cfg(unix)]
use crate::monitor::TerminateError;

/// The process table for the current operating system
pub fn process_table() -> Result<Arc<dyn ProcessTable>> {
    #[cfg(target_os = "windows")]
    {
        Ok(Arc::new(windows::WindowsProcessTable))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::MacProcessTable))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxProcessTable))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        anyhow::bail!("Unsupported operating system for process monitoring")
    }
}

/// Display names of installed applications, candidates for protection
pub fn installed_apps() -> Result<Vec<String>> {
    #[cfg(target_os = "windows")]
    {
        windows::installed_apps()
    }

    #[cfg(target_os = "macos")]
    {
        macos::installed_apps()
    }

    #[cfg(target_os = "linux")]
    {
        linux::installed_apps()
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        anyhow::bail!("Unsupported operating system for application discovery")
    }
}

/// Send SIGTERM, mapping errno to the transient error kinds
#[cfg(unix)]
fn unix_terminate(pid: u32) -> Result<(), TerminateError> {
    let raw_pid = i32::try_from(pid)
        .map_err(|_| TerminateError::Other(anyhow::anyhow!("pid {} out of range", pid)))?;
    if raw_pid <= 0 {
        return Err(TerminateError::Other(anyhow::anyhow!("refusing to signal pid {}", pid)));
    }

    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw_pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    Err(match err.raw_os_error() {
        Some(libc::ESRCH) => TerminateError::NotFound(pid),
        Some(libc::EPERM) => TerminateError::AccessDenied(pid),
        _ => TerminateError::Other(anyhow::Error::new(err).context(format!("kill({}) failed", pid))),
    })
}
