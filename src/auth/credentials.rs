use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::{AuthError, totp};
use crate::platform::common::lock_exclusive;
use crate::state;

/// Length of a recovery key
pub const RECOVERY_KEY_LEN: usize = 16;

/// Legacy PIN length bounds
pub const MIN_PIN_LEN: usize = 4;
pub const MAX_PIN_LEN: usize = 12;

const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// The active authenticator enrollment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Base32 TOTP secret
    pub totp_secret: String,
    pub identity: String,
    /// Argon2id hash of the legacy PIN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single-use recovery key, stored as the SHA-256 digest of the key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryKey {
    pub value: String,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

/// Everything the user needs to finish enrolling. Shown once.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub identity: String,
    pub secret: String,
    pub provisioning_uri: String,
    pub recovery_keys: Vec<String>,
}

/// Outcome of presenting a recovery key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    /// Accepted and now marked used; carries the number of unused keys left
    Accepted { remaining: usize },
    AlreadyUsed,
    Unknown,
}

type KeyTable = BTreeMap<String, Vec<RecoveryKey>>;

/// Sole owner of `credential.json` and `recovery_keys.json`
///
/// Files are re-read on every operation so that an enrollment made by another
/// `app-locker` process takes effect immediately. A missing or unreadable
/// store never authenticates anything.
pub struct CredentialStore {
    credential_path: PathBuf,
    keys_path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(credential_path: impl Into<PathBuf>, keys_path: impl Into<PathBuf>) -> Self {
        Self {
            credential_path: credential_path.into(),
            keys_path: keys_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The active credential, if setup has been completed
    ///
    /// A corrupt credential file reads as not configured: nothing
    /// authenticates against it and `setup` may replace it.
    pub fn credential(&self) -> Result<Option<Credential>> {
        state::load_json_or_discard(&self.credential_path, "Credential")
            .context("Failed to load credential")
    }

    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.credential()?.is_some())
    }

    /// Replace the credential and recovery keys wholesale
    pub fn enroll(&self, identity: &str, key_count: usize) -> Result<Enrollment> {
        let identity = identity.trim();
        if identity.is_empty() {
            anyhow::bail!("identity must not be empty");
        }

        let _guard = self.lock();
        let _file_lock = lock_exclusive(&self.keys_path)?;

        let secret = totp::generate_secret();
        let provisioning_uri = totp::provisioning_uri(&secret, identity)?;
        let recovery_keys: Vec<String> = (0..key_count).map(|_| generate_recovery_key()).collect();

        let mut table = KeyTable::new();
        table.insert(
            identity.to_string(),
            recovery_keys
                .iter()
                .map(|key| RecoveryKey {
                    value: digest_key(key),
                    used: false,
                    used_at: None,
                })
                .collect(),
        );

        let credential = Credential {
            totp_secret: secret.clone(),
            identity: identity.to_string(),
            pin_hash: None,
            created_at: Utc::now(),
        };

        // Keys first: a credential never exists without its key batch
        state::save_json_private(&self.keys_path, &table)
            .context("Failed to save recovery keys")?;
        state::save_json_private(&self.credential_path, &credential)
            .context("Failed to save credential")?;

        info!(
            "Enrolled authenticator for {} with {} recovery keys",
            identity, key_count
        );

        Ok(Enrollment {
            identity: identity.to_string(),
            secret,
            provisioning_uri,
            recovery_keys,
        })
    }

    /// Check a recovery key for `identity` and burn it on success
    ///
    /// The used flag is persisted before `Accepted` is returned. `key` must
    /// already be normalized to uppercase.
    pub fn consume_recovery_key(&self, identity: &str, key: &str) -> Result<KeyCheck> {
        let _guard = self.lock();
        let _file_lock = lock_exclusive(&self.keys_path)?;

        let mut table: KeyTable = state::load_json(&self.keys_path)
            .context("Failed to load recovery keys")?
            .unwrap_or_default();

        let Some(keys) = table.get_mut(identity) else {
            return Ok(KeyCheck::Unknown);
        };

        let presented = digest_key(key);
        let Some(entry) = keys
            .iter_mut()
            .find(|k| bool::from(k.value.as_bytes().ct_eq(presented.as_bytes())))
        else {
            return Ok(KeyCheck::Unknown);
        };

        if entry.used {
            return Ok(KeyCheck::AlreadyUsed);
        }

        entry.used = true;
        entry.used_at = Some(Utc::now());
        let remaining = keys.iter().filter(|k| !k.used).count();

        state::save_json_private(&self.keys_path, &table)
            .context("Failed to record recovery key use")?;

        info!("Recovery key used for {} ({} remaining)", identity, remaining);
        Ok(KeyCheck::Accepted { remaining })
    }

    /// Unused recovery keys left for `identity`
    pub fn remaining_recovery_keys(&self, identity: &str) -> Result<usize> {
        let table: KeyTable = state::load_json(&self.keys_path)
            .context("Failed to load recovery keys")?
            .unwrap_or_default();

        Ok(table
            .get(identity)
            .map(|keys| keys.iter().filter(|k| !k.used).count())
            .unwrap_or(0))
    }

    /// Set the legacy PIN (4-12 digits)
    pub fn set_pin(&self, pin: &str) -> Result<(), AuthError> {
        if !is_valid_pin(pin) {
            return Err(AuthError::InvalidFormat);
        }

        let _guard = self.lock();

        let mut credential = self.credential()?.ok_or(AuthError::NotConfigured)?;
        credential.pin_hash = Some(hash_pin(pin)?);

        state::save_json_private(&self.credential_path, &credential)
            .context("Failed to save credential")?;

        info!("Legacy PIN updated");
        Ok(())
    }

    /// Check the legacy PIN
    pub fn verify_pin(&self, pin: &str) -> Result<(), AuthError> {
        if !is_valid_pin(pin) {
            return Err(AuthError::InvalidFormat);
        }

        let credential = self.credential()?.ok_or(AuthError::NotConfigured)?;
        let Some(hash) = credential.pin_hash else {
            return Err(AuthError::NotConfigured);
        };

        let parsed = PasswordHash::new(&hash)
            .map_err(|e| anyhow::anyhow!("Failed to parse PIN hash: {}", e))?;

        if Argon2::default()
            .verify_password(pin.as_bytes(), &parsed)
            .is_ok()
        {
            Ok(())
        } else {
            warn!("Rejected legacy PIN");
            Err(AuthError::InvalidCredential)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn generate_recovery_key() -> String {
    (0..RECOVERY_KEY_LEN)
        .map(|_| KEY_ALPHABET[OsRng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

fn digest_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn is_valid_pin(pin: &str) -> bool {
    (MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

fn hash_pin(pin: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(pin.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash PIN: {}", e))?
        .to_string();
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::new(
            dir.path().join("credential.json"),
            dir.path().join("recovery_keys.json"),
        )
    }

    #[test]
    fn unconfigured_store_has_no_credential() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.is_configured().unwrap());
        assert_eq!(
            store.consume_recovery_key("parent", "ABCDEFGHIJKLMNOP").unwrap(),
            KeyCheck::Unknown
        );
    }

    #[test]
    fn enroll_issues_keys_and_secret() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let enrollment = store.enroll("parent@example.com", 6).unwrap();
        assert_eq!(enrollment.recovery_keys.len(), 6);
        for key in &enrollment.recovery_keys {
            assert_eq!(key.len(), RECOVERY_KEY_LEN);
            assert!(key.bytes().all(|b| KEY_ALPHABET.contains(&b)));
        }

        let credential = store.credential().unwrap().unwrap();
        assert_eq!(credential.totp_secret, enrollment.secret);
        assert_eq!(credential.identity, "parent@example.com");
        assert_eq!(store.remaining_recovery_keys("parent@example.com").unwrap(), 6);
    }

    #[test]
    fn recovery_keys_are_not_stored_in_plaintext() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let enrollment = store.enroll("parent", 3).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("recovery_keys.json")).unwrap();
        for key in &enrollment.recovery_keys {
            assert!(!raw.contains(key.as_str()));
        }
    }

    #[test]
    fn recovery_key_is_single_use() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let enrollment = store.enroll("parent", 6).unwrap();
        let key = &enrollment.recovery_keys[2];

        assert_eq!(
            store.consume_recovery_key("parent", key).unwrap(),
            KeyCheck::Accepted { remaining: 5 }
        );
        assert_eq!(
            store.consume_recovery_key("parent", key).unwrap(),
            KeyCheck::AlreadyUsed
        );

        // The used flag survives a fresh store over the same files
        let reopened = store_in(&dir);
        assert_eq!(
            reopened.consume_recovery_key("parent", key).unwrap(),
            KeyCheck::AlreadyUsed
        );
    }

    #[test]
    fn keys_belong_to_their_identity() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let enrollment = store.enroll("parent", 2).unwrap();

        assert_eq!(
            store
                .consume_recovery_key("someone-else", &enrollment.recovery_keys[0])
                .unwrap(),
            KeyCheck::Unknown
        );
    }

    #[test]
    fn reenrollment_invalidates_old_keys() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let first = store.enroll("parent", 2).unwrap();
        let second = store.enroll("parent", 2).unwrap();

        assert_ne!(first.secret, second.secret);
        assert_eq!(
            store
                .consume_recovery_key("parent", &first.recovery_keys[0])
                .unwrap(),
            KeyCheck::Unknown
        );
    }

    #[test]
    fn corrupt_key_store_fails_closed() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let enrollment = store.enroll("parent", 2).unwrap();
        std::fs::write(dir.path().join("recovery_keys.json"), "{oops").unwrap();

        assert!(
            store
                .consume_recovery_key("parent", &enrollment.recovery_keys[0])
                .is_err()
        );
    }

    #[test]
    fn corrupt_credential_reads_as_not_configured() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.enroll("parent", 2).unwrap();
        std::fs::write(dir.path().join("credential.json"), "{oops").unwrap();

        assert!(store.credential().unwrap().is_none());
        assert!(!store.is_configured().unwrap());
        assert!(matches!(store.verify_pin("1234"), Err(AuthError::NotConfigured)));

        // Setup can replace it
        let enrollment = store.enroll("parent", 2).unwrap();
        assert_eq!(store.credential().unwrap().unwrap().totp_secret, enrollment.secret);
    }

    #[test]
    fn key_digest_is_lowercase_sha256_hex() {
        assert_eq!(
            digest_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn empty_identity_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(store_in(&dir).enroll("   ", 6).is_err());
    }

    #[test]
    fn pin_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.enroll("parent", 1).unwrap();

        assert!(matches!(store.verify_pin("1234"), Err(AuthError::NotConfigured)));

        store.set_pin("1234").unwrap();
        store.verify_pin("1234").unwrap();
        assert!(matches!(
            store.verify_pin("4321"),
            Err(AuthError::InvalidCredential)
        ));
    }

    #[test]
    fn pin_requires_4_to_12_digits() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store.enroll("parent", 1).unwrap();

        assert!(matches!(store.set_pin("123"), Err(AuthError::InvalidFormat)));
        assert!(matches!(
            store.set_pin("1234567890123"),
            Err(AuthError::InvalidFormat)
        ));
        assert!(matches!(store.set_pin("12a4"), Err(AuthError::InvalidFormat)));
        store.set_pin("123456789012").unwrap();
    }

    #[test]
    fn set_pin_requires_enrollment() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            store_in(&dir).set_pin("1234"),
            Err(AuthError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        store_in(&dir).enroll("parent", 1).unwrap();

        for name in ["credential.json", "recovery_keys.json"] {
            let mode = std::fs::metadata(dir.path().join(name))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{} should be 0600", name);
        }
    }
}
