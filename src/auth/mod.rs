//! Authentication: TOTP codes, single-use recovery keys, the legacy PIN and
//! out-of-band credential reset

pub mod credentials;
pub mod delivery;
pub mod reset;
pub mod totp;
pub mod verifier;

pub use credentials::{Credential, CredentialStore, Enrollment, KeyCheck, RecoveryKey};
pub use delivery::{CommandDelivery, DeliveryChannel, DisabledDelivery};
pub use reset::{ResetCodeService, ResetError, ResetRequest};
pub use verifier::{AuthMethod, CodeKind, CredentialVerifier, RateLimiter, classify};

use std::time::Duration;

/// Why a presented credential was not accepted
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("enter a 6-digit authenticator code or a 16-character recovery key")]
    InvalidFormat,

    #[error("invalid code")]
    InvalidCredential,

    #[error("this recovery key has already been used")]
    AlreadyUsed,

    #[error("authentication is not configured; run `app-locker setup` first")]
    NotConfigured,

    #[error("too many failed attempts; try again in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("credential storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}
