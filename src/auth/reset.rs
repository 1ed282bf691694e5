use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::delivery::DeliveryChannel;
use crate::state;

/// Why a reset request or verification failed
#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("authentication is not configured; run `app-locker setup` instead")]
    NotConfigured,

    #[error("{0} is not the enrolled identity")]
    NotEnrolled(String),

    #[error("no reset has been requested for this identity")]
    NoPendingRequest,

    #[error("this reset code has already been used")]
    AlreadyUsed,

    #[error("this reset code has expired; request a new one")]
    Expired,

    #[error("too many wrong codes; request a new reset")]
    TooManyAttempts,

    #[error("invalid reset code")]
    InvalidCode,

    #[error("reset code could not be delivered: {0:#}")]
    Delivery(anyhow::Error),

    #[error("reset storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// A pending emailed reset code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRequest {
    pub code: String,
    pub expiry: DateTime<Utc>,
    pub used: bool,
    #[serde(default)]
    pub attempts: u32,
}

type RequestTable = BTreeMap<String, ResetRequest>;

/// Issues and checks one-time reset codes, persisted in
/// `reset_requests.json`
pub struct ResetCodeService {
    path: PathBuf,
    ttl: Duration,
    max_attempts: u32,
    delivery: Box<dyn DeliveryChannel>,
    lock: Mutex<()>,
}

impl ResetCodeService {
    pub fn new(
        path: impl Into<PathBuf>,
        ttl_minutes: u64,
        max_attempts: u32,
        delivery: Box<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            path: path.into(),
            ttl: i64::try_from(ttl_minutes)
                .ok()
                .and_then(Duration::try_minutes)
                .unwrap_or(Duration::MAX),
            max_attempts,
            delivery,
            lock: Mutex::new(()),
        }
    }

    /// Issue a fresh code for `identity`, replacing any pending one, and hand
    /// it to the delivery channel. Returns the expiry.
    pub fn request(&self, identity: &str) -> Result<DateTime<Utc>, ResetError> {
        self.request_at(identity, Utc::now())
    }

    pub fn request_at(&self, identity: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, ResetError> {
        let identity = normalize_identity(identity);
        if identity.is_empty() {
            return Err(anyhow::anyhow!("identity must not be empty").into());
        }

        let code = format!("{:06}", OsRng.gen_range(0..1_000_000u32));
        let expiry = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        {
            let _guard = self.guard();
            let mut table = match self.load() {
                Ok(table) => table,
                Err(e) => {
                    warn!("Reset request store is corrupt, starting over: {:#}", e);
                    RequestTable::new()
                }
            };
            table.insert(
                identity.clone(),
                ResetRequest {
                    code: code.clone(),
                    expiry,
                    used: false,
                    attempts: 0,
                },
            );
            self.save(&table)?;
        }

        info!("Reset requested for {} (expires {})", identity, expiry);

        // The stored request stays valid even if delivery fails
        self.delivery
            .deliver_code(&identity, &code)
            .map_err(ResetError::Delivery)?;

        Ok(expiry)
    }

    /// Check a code; success burns the request
    pub fn verify(&self, identity: &str, code: &str) -> Result<(), ResetError> {
        self.verify_at(identity, code, Utc::now())
    }

    pub fn verify_at(&self, identity: &str, code: &str, now: DateTime<Utc>) -> Result<(), ResetError> {
        let identity = normalize_identity(identity);
        let _guard = self.guard();
        let mut table = self.load()?;

        let Some(request) = table.get_mut(&identity) else {
            return Err(ResetError::NoPendingRequest);
        };

        if request.used {
            return Err(ResetError::AlreadyUsed);
        }

        if now > request.expiry {
            return Err(ResetError::Expired);
        }

        if request.attempts >= self.max_attempts {
            return Err(ResetError::TooManyAttempts);
        }

        if !bool::from(request.code.as_bytes().ct_eq(code.trim().as_bytes())) {
            request.attempts += 1;
            let attempts = request.attempts;
            self.save(&table)?;
            warn!(
                "Wrong reset code for {} ({}/{} attempts)",
                identity, attempts, self.max_attempts
            );
            return Err(ResetError::InvalidCode);
        }

        request.used = true;
        self.save(&table)?;
        info!("Reset code verified for {}", identity);
        Ok(())
    }

    /// Drop requests whose expiry has passed. Returns how many were removed.
    pub fn sweep_expired(&self) -> anyhow::Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let _guard = self.guard();
        let mut table = self.load()?;

        let before = table.len();
        table.retain(|_, request| request.expiry >= now);
        let removed = before - table.len();

        if removed > 0 {
            self.save(&table)?;
            debug!("Swept {} expired reset request(s)", removed);
        }

        Ok(removed)
    }

    /// The pending request for `identity`, if any
    pub fn pending(&self, identity: &str) -> anyhow::Result<Option<ResetRequest>> {
        Ok(self.load()?.remove(&normalize_identity(identity)))
    }

    fn load(&self) -> anyhow::Result<RequestTable> {
        Ok(state::load_json(&self.path)
            .context("Failed to load reset requests")?
            .unwrap_or_default())
    }

    fn save(&self, table: &RequestTable) -> anyhow::Result<()> {
        state::save_json_private(&self.path, table).context("Failed to save reset requests")
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Identities compare trimmed and case-insensitively
pub fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}
