//! Process monitor: polls the process table and terminates processes that
//! belong to locked applications

pub mod matcher;
pub mod notify;
pub mod process;

pub use matcher::{ExactMatcher, HeuristicMatcher, MatchStrategy, MatcherKind};
pub use notify::{DesktopNotifier, NotificationSink};
pub use process::{ProcessInfo, ProcessTable, TerminateError};

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lease::LeaseManager;
use crate::registry::LockRegistry;

/// Something the user should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Blocked { app: String, process: String, pid: u32 },
}

/// Result of one poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Processes inspected
    pub scanned: usize,
    /// (pid, app) pairs that were terminated
    pub blocked: Vec<(u32, String)>,
}

/// Watches running processes and terminates those of locked applications
pub struct ProcessMonitor {
    registry: Arc<LockRegistry>,
    leases: Arc<LeaseManager>,
    processes: Arc<dyn ProcessTable>,
    matcher: Box<dyn MatchStrategy>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    poll_interval: Duration,
    error_backoff: Duration,
    own_pid: u32,
}

/// Running monitor loop
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal the loop to stop and wait for it to finish
    pub async fn stop(self) -> Result<()> {
        // The loop may already have exited; nothing to signal then
        let _ = self.shutdown.send(true);
        self.task.await.context("Monitor task panicked")?;
        Ok(())
    }
}

impl ProcessMonitor {
    pub fn new(
        registry: Arc<LockRegistry>,
        leases: Arc<LeaseManager>,
        processes: Arc<dyn ProcessTable>,
        matcher: Box<dyn MatchStrategy>,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            registry,
            leases,
            processes,
            matcher,
            events,
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            own_pid: std::process::id(),
        }
    }

    pub fn with_intervals(mut self, poll_interval: Duration, error_backoff: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.error_backoff = error_backoff;
        self
    }

    /// Applications to enforce this tick; none while a session unlock is
    /// active
    pub fn locked_apps(&self) -> BTreeSet<String> {
        if self.leases.session_active() {
            return BTreeSet::new();
        }
        self.registry.list_locked()
    }

    /// One poll: reload, enumerate, match, terminate
    pub fn tick(&self) -> Result<TickReport> {
        self.registry.reload();

        let locked = self.locked_apps();
        if locked.is_empty() {
            return Ok(TickReport::default());
        }

        let processes = self
            .processes
            .list_processes()
            .context("Failed to enumerate processes")?;

        let mut report = TickReport {
            scanned: processes.len(),
            ..Default::default()
        };

        for process in &processes {
            if process.pid == self.own_pid {
                continue;
            }

            let Some(app) = locked
                .iter()
                .find(|app| self.matcher.matches(app, &process.name))
            else {
                continue;
            };

            match self.processes.terminate(process.pid) {
                Ok(()) => {
                    info!(
                        "Blocked {} (pid {}) for locked app {}",
                        process.name, process.pid, app
                    );
                    report.blocked.push((process.pid, app.clone()));
                    // Receiver gone only during shutdown
                    let _ = self.events.send(MonitorEvent::Blocked {
                        app: app.clone(),
                        process: process.name.clone(),
                        pid: process.pid,
                    });
                }
                Err(TerminateError::NotFound(pid)) => {
                    debug!("Process {} exited before it could be blocked", pid);
                }
                Err(e) => {
                    warn!("Failed to block {} for {}: {:#}", process.name, app, e);
                }
            }
        }

        Ok(report)
    }

    /// Run the poll loop until the handle is stopped
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                "Process monitor started (every {}s)",
                self.poll_interval.as_secs_f32()
            );

            loop {
                let monitor = Arc::clone(&self);
                let outcome = tokio::task::spawn_blocking(move || monitor.tick()).await;

                let pause = match outcome {
                    Ok(Ok(report)) => {
                        if !report.blocked.is_empty() {
                            debug!("Tick blocked {} process(es)", report.blocked.len());
                        }
                        self.poll_interval
                    }
                    Ok(Err(e)) => {
                        error!("Monitor tick failed: {:#}", e);
                        self.error_backoff
                    }
                    Err(e) => {
                        error!("Monitor tick panicked: {}", e);
                        self.error_backoff
                    }
                };

                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            info!("Process monitor stopped");
        });

        MonitorHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory process table that records terminations
    #[derive(Default)]
    struct FakeProcesses {
        running: Mutex<Vec<ProcessInfo>>,
        terminated: Mutex<Vec<u32>>,
        fail_listing: Mutex<bool>,
    }

    impl FakeProcesses {
        fn with(processes: &[(u32, &str)]) -> Arc<Self> {
            let fake = Self::default();
            *fake.running.lock().unwrap() = processes
                .iter()
                .map(|(pid, name)| ProcessInfo::new(*pid, *name))
                .collect();
            Arc::new(fake)
        }

        fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }
    }

    impl ProcessTable for FakeProcesses {
        fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
            if *self.fail_listing.lock().unwrap() {
                anyhow::bail!("process table unavailable");
            }
            Ok(self.running.lock().unwrap().clone())
        }

        fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
            let mut running = self.running.lock().unwrap();
            let before = running.len();
            running.retain(|p| p.pid != pid);
            if running.len() == before {
                return Err(TerminateError::NotFound(pid));
            }
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<LockRegistry>,
        leases: Arc<LeaseManager>,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
        monitor: Arc<ProcessMonitor>,
    }

    fn fixture(processes: Arc<FakeProcesses>) -> Fixture {
        let dir = tempdir().unwrap();
        let registry = Arc::new(LockRegistry::open(dir.path().join("registry.json")).unwrap());
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&registry),
            dir.path().join("leases.json"),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(ProcessMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&leases),
            processes,
            MatcherKind::Heuristic.build(),
            tx,
        ));

        Fixture {
            _dir: dir,
            registry,
            leases,
            events: rx,
            monitor,
        }
    }

    #[test]
    fn blocks_only_matching_processes() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe"), (200, "explorer.exe")]);
        let mut fx = fixture(Arc::clone(&processes));
        fx.registry.set_locked("Notepad", true).unwrap();

        let report = fx.monitor.tick().unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.blocked, vec![(100, "Notepad".to_string())]);
        assert_eq!(processes.terminated(), vec![100]);
        assert_eq!(
            fx.events.try_recv().unwrap(),
            MonitorEvent::Blocked {
                app: "Notepad".to_string(),
                process: "notepad.exe".to_string(),
                pid: 100,
            }
        );
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn unlocked_apps_are_left_alone() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe"), (300, "steam.exe")]);
        let fx = fixture(Arc::clone(&processes));
        fx.registry.set_locked("Notepad", false).unwrap();
        fx.registry.set_locked("Steam", true).unwrap();

        fx.monitor.tick().unwrap();
        assert_eq!(processes.terminated(), vec![300]);
    }

    #[test]
    fn session_unlock_overrides_every_lock() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe"), (300, "steam.exe")]);
        let fx = fixture(Arc::clone(&processes));
        fx.registry.set_locked("Notepad", true).unwrap();
        fx.registry.set_locked("Steam", true).unwrap();

        fx.leases.grant_session();
        assert!(fx.monitor.locked_apps().is_empty());
        assert_eq!(fx.monitor.tick().unwrap(), TickReport::default());
        assert!(processes.terminated().is_empty());

        fx.leases.lock_session();
        fx.monitor.tick().unwrap();
        assert_eq!(processes.terminated(), vec![100, 300]);
    }

    #[test]
    fn never_terminates_itself() {
        let own = std::process::id();
        let processes = FakeProcesses::with(&[(own, "app-locker")]);
        let fx = fixture(Arc::clone(&processes));
        fx.registry.set_locked("App Locker", true).unwrap();
        fx.registry.set_locked("app-locker", true).unwrap();

        fx.monitor.tick().unwrap();
        assert!(processes.terminated().is_empty());
    }

    #[test]
    fn vanished_process_is_not_an_error() {
        struct Vanishing;
        impl ProcessTable for Vanishing {
            fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
                Ok(vec![ProcessInfo::new(100, "notepad.exe")])
            }
            fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
                Err(TerminateError::NotFound(pid))
            }
        }

        let dir = tempdir().unwrap();
        let registry = Arc::new(LockRegistry::open(dir.path().join("registry.json")).unwrap());
        registry.set_locked("Notepad", true).unwrap();
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&registry),
            dir.path().join("leases.json"),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ProcessMonitor::new(
            registry,
            leases,
            Arc::new(Vanishing),
            MatcherKind::Heuristic.build(),
            tx,
        );

        let report = monitor.tick().unwrap();
        assert!(report.blocked.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn listing_failure_surfaces_as_tick_error() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe")]);
        *processes.fail_listing.lock().unwrap() = true;
        let fx = fixture(Arc::clone(&processes));
        fx.registry.set_locked("Notepad", true).unwrap();

        assert!(fx.monitor.tick().is_err());
    }

    #[test]
    fn picks_up_registry_edits_from_disk() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe")]);
        let fx = fixture(Arc::clone(&processes));

        // Another process protects Notepad
        let other = LockRegistry::open(fx.registry.path()).unwrap();
        other.set_locked("Notepad", true).unwrap();

        fx.monitor.tick().unwrap();
        assert_eq!(processes.terminated(), vec![100]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_polls_until_stopped() {
        let processes = FakeProcesses::with(&[(100, "notepad.exe")]);
        let fx = fixture(Arc::clone(&processes));

        let handle = Arc::clone(&fx.monitor).start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(processes.terminated().is_empty());

        // Protected while the loop runs; caught on a later tick
        fx.registry.set_locked("Notepad", true).unwrap();
        processes
            .running
            .lock()
            .unwrap()
            .push(ProcessInfo::new(101, "notepad.exe"));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while processes.terminated().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(processes.terminated(), vec![100, 101]);

        handle.stop().await.unwrap();
    }
}
