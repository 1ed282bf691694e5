use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::{CredentialStore, KeyCheck, RECOVERY_KEY_LEN};
use super::{AuthError, totp};
use crate::platform::common::lock_exclusive;
use crate::state;

/// What a presented code looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeKind {
    /// Six decimal digits
    Totp(String),
    /// Sixteen alphanumerics, normalized to uppercase
    RecoveryKey(String),
}

/// How a successful authentication was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Totp,
    RecoveryKey { remaining: usize },
}

/// Decide how to verify `input` from its shape alone
pub fn classify(input: &str) -> Result<CodeKind, AuthError> {
    let input = input.trim();

    if input.len() == totp::DIGITS && input.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(CodeKind::Totp(input.to_string()));
    }

    if input.len() == RECOVERY_KEY_LEN && input.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Ok(CodeKind::RecoveryKey(input.to_ascii_uppercase()));
    }

    Err(AuthError::InvalidFormat)
}

/// Sliding-window counter of failed attempts
///
/// With a backing file the window is shared by every `app-locker` process:
/// each check re-reads the file and each change rewrites it under an
/// exclusive file lock, so separate CLI invocations cannot each start from
/// zero. Timestamps are wall-clock so they survive a restart.
pub struct RateLimiter {
    failures: Vec<DateTime<Utc>>,
    max_failures: usize,
    window_duration: chrono::Duration,
    path: Option<PathBuf>,
}

impl RateLimiter {
    /// A limiter that lives only in this process
    pub fn new(max_failures: usize, window_seconds: u64) -> Self {
        Self {
            failures: Vec::new(),
            max_failures,
            window_duration: i64::try_from(window_seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            path: None,
        }
    }

    /// A limiter whose failures are shared through `path`
    pub fn persistent(max_failures: usize, window_seconds: u64, path: impl Into<PathBuf>) -> Self {
        let mut limiter = Self::new(max_failures, window_seconds);
        limiter.path = Some(path.into());
        limiter.refresh();
        limiter
    }

    /// Check if another attempt is allowed
    pub fn is_allowed(&mut self) -> bool {
        self.refresh();
        self.prune(Utc::now());
        self.failures.len() < self.max_failures
    }

    pub fn record_failure(&mut self) {
        self.modify(|failures| failures.push(Utc::now()));
    }

    /// Get time until next attempt is allowed
    pub fn time_until_allowed(&self) -> Option<Duration> {
        if self.failures.len() < self.max_failures {
            return None;
        }

        let oldest = self.failures.iter().min()?;
        let remaining = oldest
            .checked_add_signed(self.window_duration)
            .map(|until| until - Utc::now())
            .unwrap_or(chrono::Duration::MAX);

        if remaining > chrono::Duration::zero() {
            let window = self.window_duration.to_std().unwrap_or(Duration::MAX);
            Some(remaining.to_std().unwrap_or_default().min(window))
        } else {
            None
        }
    }

    /// Reset the rate limiter
    pub fn reset(&mut self) {
        self.modify(|failures| failures.clear());
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window_duration;
        self.failures.retain(|&failure| now - failure < window);
    }

    /// Pick up failures recorded by other processes
    fn refresh(&mut self) {
        let Some(path) = &self.path else {
            return;
        };

        match state::load_json_or_discard::<Vec<DateTime<Utc>>>(path, "Failure log") {
            Ok(failures) => self.failures = failures.unwrap_or_default(),
            Err(e) => warn!("Could not read failure log, keeping current count: {:#}", e),
        }
    }

    /// Read-modify-write the failure list, on disk when backed by a file
    fn modify(&mut self, change: impl FnOnce(&mut Vec<DateTime<Utc>>)) {
        let Some(path) = self.path.clone() else {
            change(&mut self.failures);
            return;
        };

        let _file_lock = match lock_exclusive(&path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("Could not lock failure log: {:#}", e);
                None
            }
        };

        self.refresh();
        change(&mut self.failures);
        self.prune(Utc::now());

        if let Err(e) = state::save_json_private(&path, &self.failures) {
            warn!("Could not save failure log: {:#}", e);
        }
    }
}

/// Verifies authenticator codes and recovery keys against the active
/// credential
pub struct CredentialVerifier {
    store: Arc<CredentialStore>,
    window: u8,
    limiter: Mutex<RateLimiter>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<CredentialStore>, window: u8, limiter: RateLimiter) -> Self {
        Self {
            store,
            window,
            limiter: Mutex::new(limiter),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Authenticate a TOTP code or recovery key at the current time
    pub fn authenticate(&self, input: &str) -> Result<AuthMethod, AuthError> {
        self.authenticate_at(input, chrono::Utc::now().timestamp())
    }

    /// Authenticate as of `unix_time` (TOTP steps are derived from it)
    pub fn authenticate_at(&self, input: &str, unix_time: i64) -> Result<AuthMethod, AuthError> {
        let kind = classify(input)?;
        self.check_rate_limit()?;

        let credential = self.store.credential()?.ok_or(AuthError::NotConfigured)?;

        let result = match kind {
            CodeKind::Totp(code) => {
                if totp::verify_at(&credential.totp_secret, &code, self.window, unix_time)? {
                    Ok(AuthMethod::Totp)
                } else {
                    Err(AuthError::InvalidCredential)
                }
            }
            CodeKind::RecoveryKey(key) => {
                match self.store.consume_recovery_key(&credential.identity, &key)? {
                    KeyCheck::Accepted { remaining } => Ok(AuthMethod::RecoveryKey { remaining }),
                    KeyCheck::AlreadyUsed => Err(AuthError::AlreadyUsed),
                    KeyCheck::Unknown => Err(AuthError::InvalidCredential),
                }
            }
        };

        self.record(&result);
        result
    }

    /// Check the legacy PIN, subject to the same rate limit
    pub fn verify_pin(&self, pin: &str) -> Result<(), AuthError> {
        self.check_rate_limit()?;
        let result = self.store.verify_pin(pin);
        match &result {
            Ok(()) => self.limiter().reset(),
            Err(AuthError::InvalidCredential) => self.limiter().record_failure(),
            Err(_) => {}
        }
        result
    }

    fn check_rate_limit(&self) -> Result<(), AuthError> {
        let mut limiter = self.limiter();
        if limiter.is_allowed() {
            return Ok(());
        }

        let retry_after = limiter.time_until_allowed().unwrap_or_default();
        warn!("Verification refused: too many failed attempts");
        Err(AuthError::RateLimited { retry_after })
    }

    fn record(&self, result: &Result<AuthMethod, AuthError>) {
        match result {
            Ok(method) => {
                debug!("Authenticated via {:?}", method);
                self.limiter().reset();
            }
            Err(AuthError::InvalidCredential | AuthError::AlreadyUsed) => {
                warn!("Rejected credential");
                self.limiter().record_failure();
            }
            Err(_) => {}
        }
    }

    fn limiter(&self) -> std::sync::MutexGuard<'_, RateLimiter> {
        self.limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
