use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::registry::LockRegistry;
use crate::state;

/// Delay before retrying a re-lock that could not be persisted
const RELOCK_RETRY: Duration = Duration::from_secs(5);

/// What happens to unlocked applications when the locker restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestorePolicy {
    /// Lock everything again
    #[default]
    FailClosed,
    /// Resume unexpired temporary unlocks and the session
    Persist,
}

/// Current unlock state of one application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    None,
    Temporary { expires_at: DateTime<Utc> },
    Session,
}

/// What `restore` did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub relocked: Vec<String>,
    pub resumed: Vec<String>,
    pub session: bool,
}

/// On-disk form of `leases.json`
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    #[serde(default)]
    session: bool,
    #[serde(default)]
    temporary: BTreeMap<String, DateTime<Utc>>,
}

struct ActiveLease {
    generation: u64,
    expires_at: DateTime<Utc>,
    timer: AbortHandle,
}

#[derive(Default)]
struct LeaseTable {
    next_generation: u64,
    active: HashMap<String, ActiveLease>,
}

/// Schedules re-lock transitions for temporarily unlocked applications and
/// holds the session-wide unlock flag
///
/// Every timer carries the generation of the grant that created it. A timer
/// only re-locks if its generation is still the active one, so a superseded
/// timer is a no-op even if aborting it raced with it firing. The lease table
/// lock is always taken before the registry's, which keeps timer expiry
/// atomic with respect to new grants and manual re-locks.
pub struct LeaseManager {
    registry: Arc<LockRegistry>,
    path: PathBuf,
    session: AtomicBool,
    table: Mutex<LeaseTable>,
}

impl LeaseManager {
    pub fn new(registry: Arc<LockRegistry>, path: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            path: path.into(),
            session: AtomicBool::new(false),
            table: Mutex::new(LeaseTable::default()),
        }
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Fail early with the error `grant_temporary` would return, without
    /// touching any state
    ///
    /// Lets callers refuse before spending a single-use credential.
    pub fn check_grant(&self, app_id: &str, duration: Duration) -> Result<()> {
        Handle::try_current().context("Temporary unlocks need a running async runtime")?;
        expiry_after(duration)?;
        if !self.registry.contains(app_id) {
            anyhow::bail!("{} is not a protected application", app_id);
        }
        Ok(())
    }

    /// Unlock `app_id` now and re-lock it after `duration`
    ///
    /// Replaces any earlier temporary unlock of the same application.
    pub fn grant_temporary(self: &Arc<Self>, app_id: &str, duration: Duration) -> Result<DateTime<Utc>> {
        let runtime = Handle::try_current().context("Temporary unlocks need a running async runtime")?;
        let expires_at = expiry_after(duration)?;

        let mut table = self.table();

        if !self.registry.contains(app_id) {
            anyhow::bail!("{} is not a protected application", app_id);
        }

        self.registry.set_locked(app_id, false)?;
        self.arm(&runtime, &mut table, app_id, expires_at, duration);
        self.persist(&table);

        info!(
            "Unlocked {} until {}",
            app_id,
            expires_at.with_timezone(&chrono::Local).format("%H:%M:%S")
        );
        Ok(expires_at)
    }

    /// Unlock every protected application until `lock_session`
    pub fn grant_session(&self) {
        self.session.store(true, Ordering::SeqCst);
        self.persist(&self.table());
        info!("Session unlock started: all applications allowed");
    }

    pub fn lock_session(&self) {
        self.session.store(false, Ordering::SeqCst);
        self.persist(&self.table());
        info!("Session unlock ended");
    }

    pub fn session_active(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    /// Drop a temporary unlock without touching the registry
    ///
    /// Returns whether a lease was active.
    pub fn cancel(&self, app_id: &str) -> bool {
        let mut table = self.table();
        let Some(lease) = table.active.remove(app_id) else {
            return false;
        };
        lease.timer.abort();
        self.persist(&table);
        debug!("Cancelled lease for {}", app_id);
        true
    }

    pub fn mode(&self, app_id: &str) -> LeaseMode {
        if self.session_active() {
            return LeaseMode::Session;
        }

        match self.table().active.get(app_id) {
            Some(lease) => LeaseMode::Temporary {
                expires_at: lease.expires_at,
            },
            None => LeaseMode::None,
        }
    }

    /// Reconcile the registry with the lease state left by a previous run
    pub fn restore(self: &Arc<Self>, policy: RestorePolicy) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let saved = match policy {
            RestorePolicy::FailClosed => LeaseFile::default(),
            RestorePolicy::Persist => match state::load_json::<LeaseFile>(&self.path) {
                Ok(saved) => saved.unwrap_or_default(),
                Err(e) => {
                    warn!("Lease file is unreadable, locking everything: {:#}", e);
                    LeaseFile::default()
                }
            },
        };

        let now = Utc::now();
        let mut table = self.table();

        for entry in self.registry.entries() {
            if entry.locked {
                continue;
            }

            let remaining = saved
                .temporary
                .get(&entry.app_identifier)
                .filter(|expires_at| **expires_at > now)
                .and_then(|expires_at| {
                    (*expires_at - now)
                        .to_std()
                        .ok()
                        .map(|duration| (*expires_at, duration))
                });

            match remaining {
                Some((expires_at, duration)) => {
                    let runtime = Handle::try_current()
                        .context("Resuming unlocks needs a running async runtime")?;
                    self.arm(&runtime, &mut table, &entry.app_identifier, expires_at, duration);
                    report.resumed.push(entry.app_identifier);
                }
                None => {
                    self.registry
                        .set_locked(&entry.app_identifier, true)
                        .with_context(|| format!("Failed to re-lock {}", entry.app_identifier))?;
                    report.relocked.push(entry.app_identifier);
                }
            }
        }

        report.session = saved.session;
        self.session.store(saved.session, Ordering::SeqCst);
        self.persist(&table);

        info!(
            "Restored leases ({:?}): {} re-locked, {} resumed, session {}",
            policy,
            report.relocked.len(),
            report.resumed.len(),
            if report.session { "active" } else { "inactive" }
        );

        Ok(report)
    }

    /// Record a lease and spawn its timer, aborting any previous one
    fn arm(
        self: &Arc<Self>,
        runtime: &Handle,
        table: &mut LeaseTable,
        app_id: &str,
        expires_at: DateTime<Utc>,
        duration: Duration,
    ) {
        let generation = table.next_generation;
        table.next_generation += 1;

        let timer = runtime
            .spawn(relock_after(
                Arc::downgrade(self),
                app_id.to_string(),
                generation,
                duration,
            ))
            .abort_handle();

        let lease = ActiveLease {
            generation,
            expires_at,
            timer,
        };

        if let Some(previous) = table.active.insert(app_id.to_string(), lease) {
            previous.timer.abort();
        }
    }

    /// Timer callback: re-lock if `generation` is still current
    fn expire(self: &Arc<Self>, app_id: &str, generation: u64) {
        let mut table = self.table();

        match table.active.get(app_id) {
            Some(lease) if lease.generation == generation => {}
            _ => {
                debug!("Ignoring superseded lease timer for {}", app_id);
                return;
            }
        }

        match self.registry.relock_if_present(app_id) {
            Ok(true) => info!("Unlock for {} expired; locked again", app_id),
            Ok(false) => debug!("{} was removed while unlocked", app_id),
            Err(e) => {
                error!("Failed to re-lock {}, retrying: {:#}", app_id, e);
                let weak = Arc::downgrade(self);
                let app = app_id.to_string();
                tokio::spawn(relock_after(weak, app, generation, RELOCK_RETRY));
                return;
            }
        }

        table.active.remove(app_id);
        self.persist(&table);
    }

    fn persist(&self, table: &LeaseTable) {
        let file = LeaseFile {
            session: self.session_active(),
            temporary: table
                .active
                .iter()
                .map(|(app, lease)| (app.clone(), lease.expires_at))
                .collect(),
        };

        if let Err(e) = state::save_json(&self.path, &file) {
            warn!("Failed to persist leases: {:#}", e);
        }
    }

    fn table(&self) -> MutexGuard<'_, LeaseTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn expiry_after(duration: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .context("Unlock duration is too long")
}

async fn relock_after(manager: Weak<LeaseManager>, app_id: String, generation: u64, duration: Duration) {
    tokio::time::sleep(duration).await;
    if let Some(manager) = manager.upgrade() {
        manager.expire(&app_id, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const D: Duration = Duration::from_secs(60);

    fn setup(dir: &tempfile::TempDir) -> (Arc<LockRegistry>, Arc<LeaseManager>) {
        let registry = Arc::new(LockRegistry::open(dir.path().join("registry.json")).unwrap());
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&registry),
            dir.path().join("leases.json"),
        ));
        (registry, leases)
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_unlock_relocks_after_duration() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Notepad", true).unwrap();

        leases.grant_temporary("Notepad", D).unwrap();
        assert!(!registry.is_locked("Notepad"));
        assert!(matches!(leases.mode("Notepad"), LeaseMode::Temporary { .. }));

        tokio::time::sleep(D - Duration::from_secs(1)).await;
        assert!(!registry.is_locked("Notepad"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.is_locked("Notepad"));
        assert_eq!(leases.mode("Notepad"), LeaseMode::None);
    }

    #[tokio::test(start_paused = true)]
    async fn later_grant_supersedes_earlier() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Steam", true).unwrap();

        leases.grant_temporary("Steam", D).unwrap();
        tokio::time::sleep(D / 2).await;
        leases.grant_temporary("Steam", D).unwrap();

        // Past the first deadline: the first timer must not fire
        tokio::time::sleep(D / 2 + Duration::from_secs(1)).await;
        assert!(!registry.is_locked("Steam"));

        // Past the second deadline
        tokio::time::sleep(D / 2).await;
        assert!(registry.is_locked("Steam"));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_is_a_noop() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Steam", true).unwrap();

        leases.grant_temporary("Steam", D).unwrap();
        leases.grant_temporary("Steam", D * 2).unwrap();

        // A stale generation arriving late changes nothing
        leases.expire("Steam", 0);
        assert!(!registry.is_locked("Steam"));

        tokio::time::sleep(D * 2 + Duration::from_secs(1)).await;
        assert!(registry.is_locked("Steam"));
    }

    #[tokio::test(start_paused = true)]
    async fn removal_before_expiry_is_not_undone() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Discord", true).unwrap();

        leases.grant_temporary("Discord", D).unwrap();
        registry.remove("Discord").unwrap();

        tokio::time::sleep(D + Duration::from_secs(1)).await;
        assert!(!registry.contains("Discord"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_timer() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Zoom", true).unwrap();

        leases.grant_temporary("Zoom", D).unwrap();
        assert!(leases.cancel("Zoom"));
        assert!(!leases.cancel("Zoom"));

        // Cancel leaves the registry alone; nothing re-locks it later
        tokio::time::sleep(D + Duration::from_secs(1)).await;
        assert!(!registry.is_locked("Zoom"));
    }

    #[tokio::test]
    async fn unprotected_app_cannot_be_granted() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);

        assert!(leases.grant_temporary("Notepad", D).is_err());
        assert!(!registry.contains("Notepad"));
    }

    #[test]
    fn grant_without_runtime_is_an_error() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Notepad", true).unwrap();

        assert!(leases.grant_temporary("Notepad", D).is_err());
        assert!(registry.is_locked("Notepad"));
    }

    #[test]
    fn session_flag_toggles() {
        let dir = tempdir().unwrap();
        let (_registry, leases) = setup(&dir);

        assert!(!leases.session_active());
        leases.grant_session();
        assert!(leases.session_active());
        assert_eq!(leases.mode("anything"), LeaseMode::Session);
        leases.lock_session();
        assert!(!leases.session_active());
    }

    #[tokio::test]
    async fn fail_closed_restore_relocks_everything() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Notepad", true).unwrap();
        registry.set_locked("Steam", false).unwrap();
        leases.grant_session();

        let fresh = Arc::new(LeaseManager::new(
            Arc::clone(&registry),
            dir.path().join("leases.json"),
        ));
        let report = fresh.restore(RestorePolicy::FailClosed).unwrap();

        assert_eq!(report.relocked, vec!["Steam".to_string()]);
        assert!(!report.session);
        assert!(!fresh.session_active());
        assert!(registry.is_locked("Steam"));
        assert!(registry.is_locked("Notepad"));
    }

    #[tokio::test(start_paused = true)]
    async fn persist_restore_resumes_unexpired_leases() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        for app in ["Steam", "Discord", "Zoom"] {
            registry.set_locked(app, false).unwrap();
        }
        registry.set_locked("Notepad", true).unwrap();

        let now = Utc::now();
        let saved = LeaseFile {
            session: true,
            temporary: BTreeMap::from([
                ("Steam".to_string(), now + chrono::Duration::minutes(10)),
                ("Discord".to_string(), now - chrono::Duration::minutes(1)),
            ]),
        };
        state::save_json(&dir.path().join("leases.json"), &saved).unwrap();

        let report = leases.restore(RestorePolicy::Persist).unwrap();
        assert_eq!(report.resumed, vec!["Steam".to_string()]);
        assert_eq!(
            report.relocked,
            vec!["Discord".to_string(), "Zoom".to_string()]
        );
        assert!(report.session);
        assert!(leases.session_active());

        assert!(!registry.is_locked("Steam"));
        assert!(registry.is_locked("Discord"));
        assert!(registry.is_locked("Zoom"));

        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        assert!(registry.is_locked("Steam"));
    }

    #[tokio::test]
    async fn leases_are_persisted() {
        let dir = tempdir().unwrap();
        let (registry, leases) = setup(&dir);
        registry.set_locked("Steam", true).unwrap();

        let expires_at = leases.grant_temporary("Steam", D).unwrap();

        let saved: LeaseFile = state::load_json(&dir.path().join("leases.json"))
            .unwrap()
            .unwrap();
        assert_eq!(saved.temporary.get("Steam"), Some(&expires_at));
        assert!(!saved.session);
    }
}
