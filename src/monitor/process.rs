use anyhow::Result;

/// A running process as seen by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable or display name, e.g. `notepad.exe` or `firefox`
    pub name: String,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

/// Why a termination request did not succeed
///
/// All variants are transient from the monitor's point of view: they are
/// logged and the loop moves on.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("process {0} no longer exists")]
    NotFound(u32),

    #[error("access denied terminating process {0}")]
    AccessDenied(u32),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// OS process table: enumerate running processes and terminate them
pub trait ProcessTable: Send + Sync {
    /// List running processes. Processes that vanish or deny access while
    /// being inspected are left out rather than reported as errors.
    fn list_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Best-effort termination of a single process
    fn terminate(&self, pid: u32) -> Result<(), TerminateError>;
}
