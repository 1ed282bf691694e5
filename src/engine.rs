use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::auth::reset::normalize_identity;
use crate::auth::{
    AuthMethod, CredentialStore, CredentialVerifier, DeliveryChannel, Enrollment, RateLimiter,
    ResetCodeService, ResetError,
};
use crate::config::AppLockerConfig;
use crate::lease::{LeaseManager, LeaseMode};
use crate::registry::LockRegistry;
use crate::state::DataPaths;

/// One row of `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub app_identifier: String,
    pub locked: bool,
    pub lease: LeaseMode,
}

/// Everything a user-facing flow needs, wired to one data directory
pub struct Engine {
    config: AppLockerConfig,
    paths: DataPaths,
    registry: Arc<LockRegistry>,
    leases: Arc<LeaseManager>,
    verifier: CredentialVerifier,
    resets: ResetCodeService,
}

impl Engine {
    /// Open every store under the configured data directory
    pub fn open(config: AppLockerConfig, delivery: Box<dyn DeliveryChannel>) -> Result<Self> {
        let paths = DataPaths::new(config.data_dir()?);
        crate::platform::common::ensure_directory_exists(paths.root())
            .with_context(|| format!("Failed to create data directory: {}", paths.root().display()))?;

        let registry = Arc::new(
            LockRegistry::open(paths.registry()).context("Failed to open lock registry")?,
        );
        let leases = Arc::new(LeaseManager::new(Arc::clone(&registry), paths.leases()));

        let credentials = Arc::new(CredentialStore::new(paths.credential(), paths.recovery_keys()));
        let verifier = CredentialVerifier::new(
            credentials,
            config.auth.totp_window,
            RateLimiter::persistent(
                config.auth.max_failures,
                config.auth.failure_window,
                paths.auth_failures(),
            ),
        );

        let resets = ResetCodeService::new(
            paths.reset_requests(),
            config.reset.code_ttl_minutes,
            config.reset.max_attempts,
            delivery,
        );

        Ok(Self {
            config,
            paths,
            registry,
            leases,
            verifier,
            resets,
        })
    }

    pub fn config(&self) -> &AppLockerConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        self.verifier.store()
    }

    pub fn resets(&self) -> &ResetCodeService {
        &self.resets
    }

    /// First-time enrollment. Refuses to replace an existing credential;
    /// that is what the reset flow is for.
    pub fn setup(&self, identity: &str) -> Result<Enrollment> {
        if self.credentials().is_configured()? {
            anyhow::bail!(
                "authentication is already configured; use `app-locker reset request` to replace it"
            );
        }
        self.credentials()
            .enroll(identity, self.config.auth.recovery_key_count)
    }

    /// Start protecting an application. Returns false if it was already
    /// protected (it is locked again either way).
    pub fn protect(&self, app_id: &str) -> Result<bool> {
        let app_id = normalize_app(app_id)?;
        let existed = self.registry.contains(app_id);
        self.leases.cancel(app_id);
        self.registry.set_locked(app_id, true)?;
        info!("Protecting {}", app_id);
        Ok(!existed)
    }

    /// Lock a protected application immediately, ending any unlock
    pub fn lock_now(&self, app_id: &str) -> Result<()> {
        let app_id = self.require_protected(app_id)?;
        self.leases.cancel(app_id);
        self.registry.set_locked(app_id, true)?;
        info!("Locked {}", app_id);
        Ok(())
    }

    /// Stop protecting an application; needs a code
    pub fn unprotect(&self, app_id: &str, code: &str) -> Result<AuthMethod> {
        let app_id = self.require_protected(app_id)?;
        let method = self.verifier.authenticate(code)?;

        self.leases.cancel(app_id);
        self.registry.remove(app_id)?;
        info!("Stopped protecting {}", app_id);
        Ok(method)
    }

    /// Temporarily unlock an application with a TOTP code or recovery key
    pub fn unlock(
        &self,
        app_id: &str,
        code: &str,
        duration: Option<Duration>,
    ) -> Result<(DateTime<Utc>, AuthMethod)> {
        let app_id = self.require_protected(app_id)?;
        let duration = duration.unwrap_or_else(|| self.config.lease.default_duration());
        self.leases.check_grant(app_id, duration)?;

        let method = self.verifier.authenticate(code)?;
        let expires_at = self.grant(app_id, Some(duration)).inspect_err(|e| {
            if let AuthMethod::RecoveryKey { .. } = method {
                error!("Recovery key was spent but unlocking {} failed: {:#}", app_id, e);
            }
        })?;
        Ok((expires_at, method))
    }

    /// Temporarily unlock an application with the legacy PIN
    pub fn unlock_with_pin(
        &self,
        app_id: &str,
        pin: &str,
        duration: Option<Duration>,
    ) -> Result<DateTime<Utc>> {
        let app_id = self.require_protected(app_id)?;
        self.verifier.verify_pin(pin)?;
        self.grant(app_id, duration)
    }

    /// Allow every protected application until `lock_session`
    pub fn unlock_session(&self, code: &str) -> Result<AuthMethod> {
        let method = self.verifier.authenticate(code)?;
        self.leases.grant_session();
        Ok(method)
    }

    pub fn lock_session(&self) {
        self.leases.lock_session();
    }

    /// Set the legacy PIN; needs a code
    pub fn set_pin(&self, code: &str, pin: &str) -> Result<()> {
        self.verifier.authenticate(code)?;
        self.credentials().set_pin(pin)?;
        Ok(())
    }

    /// Email a reset code to the enrolled identity
    ///
    /// Any other identity is refused, so only the owner of the enrolled
    /// mailbox can replace the credential.
    pub fn request_reset(&self, identity: &str) -> Result<DateTime<Utc>, ResetError> {
        self.enrolled_identity(identity)?;
        self.resets.request(identity)
    }

    /// Check the emailed code and enroll a new secret and recovery keys
    pub fn complete_reset(&self, identity: &str, code: &str) -> Result<Enrollment> {
        // Re-checked: the credential may have changed since the request
        let enrolled = self.enrolled_identity(identity)?;
        self.resets.verify(identity, code)?;
        let enrollment = self
            .credentials()
            .enroll(&enrolled, self.config.auth.recovery_key_count)
            .context("Reset code accepted but re-enrollment failed")?;
        info!("Authenticator reset for {}", enrollment.identity);
        Ok(enrollment)
    }

    /// Every protected application with its lock and lease state
    pub fn status(&self) -> Vec<AppStatus> {
        self.registry
            .entries()
            .into_iter()
            .map(|entry| {
                let lease = self.leases.mode(&entry.app_identifier);
                AppStatus {
                    app_identifier: entry.app_identifier,
                    locked: entry.locked,
                    lease,
                }
            })
            .collect()
    }

    /// The stored identity of the active credential, if `identity` names it
    fn enrolled_identity(&self, identity: &str) -> Result<String, ResetError> {
        let credential = self
            .credentials()
            .credential()?
            .ok_or(ResetError::NotConfigured)?;

        if normalize_identity(&credential.identity) != normalize_identity(identity) {
            warn!("Reset refused for non-enrolled identity {}", identity.trim());
            return Err(ResetError::NotEnrolled(identity.trim().to_string()));
        }

        Ok(credential.identity)
    }

    fn grant(&self, app_id: &str, duration: Option<Duration>) -> Result<DateTime<Utc>> {
        let duration = duration.unwrap_or_else(|| self.config.lease.default_duration());
        self.leases.grant_temporary(app_id, duration)
    }

    fn require_protected<'a>(&self, app_id: &'a str) -> Result<&'a str> {
        let app_id = normalize_app(app_id)?;
        if !self.registry.contains(app_id) {
            anyhow::bail!("{} is not a protected application", app_id);
        }
        Ok(app_id)
    }
}

fn normalize_app(app_id: &str) -> Result<&str> {
    let app_id = app_id.trim();
    if app_id.is_empty() {
        anyhow::bail!("application name must not be empty");
    }
    Ok(app_id)
}
