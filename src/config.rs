use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lease::RestorePolicy;
use crate::monitor::MatcherKind;

/// Application locker configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppLockerConfig {
    /// Where the registry, credentials and leases are stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub lease: LeaseSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub reset: ResetSettings,

    #[serde(default)]
    pub delivery: DeliverySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process monitor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// Seconds between poll ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Seconds to pause after a failed tick
    #[serde(default = "default_error_backoff")]
    pub error_backoff: u64,

    /// How process names are matched against protected applications
    #[serde(default)]
    pub matcher: MatcherKind,
}

/// Unlock lease settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseSettings {
    /// Length of a temporary unlock when none is given
    #[serde(default = "default_lease_minutes")]
    pub default_minutes: u64,

    /// What happens to unlocked applications when the locker restarts
    #[serde(default)]
    pub restore: RestorePolicy,
}

/// Credential verification settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSettings {
    /// Accepted clock skew in 30-second TOTP steps
    #[serde(default = "default_totp_window")]
    pub totp_window: u8,

    /// Recovery keys issued per enrollment
    #[serde(default = "default_recovery_key_count")]
    pub recovery_key_count: usize,

    /// Failed verifications tolerated within `failure_window`
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,

    /// Sliding window for failed verifications (seconds)
    #[serde(default = "default_failure_window")]
    pub failure_window: u64,
}

/// Credential reset settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResetSettings {
    /// Lifetime of an emailed reset code
    #[serde(default = "default_code_ttl_minutes")]
    pub code_ttl_minutes: u64,

    /// Wrong codes accepted before a reset request is burned
    #[serde(default = "default_reset_attempts")]
    pub max_attempts: u32,

    /// Seconds between sweeps of expired reset requests
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
}

/// Out-of-band code delivery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeliverySettings {
    /// Command that receives a full email message on stdin, e.g.
    /// `["/usr/sbin/sendmail", "-t"]`. Delivery is disabled when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Sender address for reset emails
    #[serde(default = "default_from")]
    pub from: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values
fn default_poll_interval() -> u64 {
    2
}

fn default_error_backoff() -> u64 {
    5
}

fn default_lease_minutes() -> u64 {
    60
}

fn default_totp_window() -> u8 {
    1
}

fn default_recovery_key_count() -> usize {
    6
}

fn default_max_failures() -> usize {
    5
}

fn default_failure_window() -> u64 {
    60
}

fn default_code_ttl_minutes() -> u64 {
    15
}

fn default_reset_attempts() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_from() -> String {
    "applocker@localhost".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            error_backoff: default_error_backoff(),
            matcher: MatcherKind::default(),
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_minutes: default_lease_minutes(),
            restore: RestorePolicy::default(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            totp_window: default_totp_window(),
            recovery_key_count: default_recovery_key_count(),
            max_failures: default_max_failures(),
            failure_window: default_failure_window(),
        }
    }
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            code_ttl_minutes: default_code_ttl_minutes(),
            max_attempts: default_reset_attempts(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            from: default_from(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff)
    }
}

impl LeaseSettings {
    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_minutes * 60)
    }
}

impl AppLockerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppLockerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load(path)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        crate::platform::common::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval == 0 {
            anyhow::bail!("monitor.poll_interval must be at least 1 second");
        }

        if self.monitor.error_backoff == 0 {
            anyhow::bail!("monitor.error_backoff must be at least 1 second");
        }

        if self.lease.default_minutes == 0 {
            anyhow::bail!("lease.default_minutes must be at least 1");
        }

        if self.auth.totp_window > 10 {
            anyhow::bail!(
                "auth.totp_window must be at most 10 steps (got: {})",
                self.auth.totp_window
            );
        }

        if self.auth.recovery_key_count == 0 {
            anyhow::bail!("auth.recovery_key_count must be at least 1");
        }

        if self.auth.max_failures == 0 {
            anyhow::bail!("auth.max_failures must be at least 1");
        }

        if self.reset.code_ttl_minutes == 0 {
            anyhow::bail!("reset.code_ttl_minutes must be at least 1");
        }

        if self.reset.max_attempts == 0 {
            anyhow::bail!("reset.max_attempts must be at least 1");
        }

        if self.reset.sweep_interval == 0 {
            anyhow::bail!("reset.sweep_interval must be at least 1 second");
        }

        Ok(())
    }

    /// Resolve the data directory, defaulting to the platform data dir
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }

        let dirs = directories::ProjectDirs::from("", "", "app-locker")
            .context("Could not determine data directory")?;
        Ok(dirs.data_local_dir().to_path_buf())
    }
}

/// Get the platform-specific config file path
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "app-locker")
        .context("Could not determine config directory")?;

    Ok(dirs.config_dir().join("config.toml"))
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.toml");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_match_reference_behavior() {
        let config = AppLockerConfig::default();
        assert_eq!(config.monitor.poll_interval, 2);
        assert_eq!(config.monitor.error_backoff, 5);
        assert_eq!(config.lease.default_minutes, 60);
        assert_eq!(config.lease.restore, RestorePolicy::FailClosed);
        assert_eq!(config.auth.totp_window, 1);
        assert_eq!(config.auth.recovery_key_count, 6);
        assert_eq!(config.reset.code_ttl_minutes, 15);
        assert_eq!(config.reset.max_attempts, 3);
        assert!(config.delivery.command.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn example_config_parses_and_validates() {
        let config: AppLockerConfig = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: AppLockerConfig = toml::from_str(
            r#"
            [monitor]
            poll_interval = 3
            matcher = "exact"

            [lease]
            restore = "persist"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.poll_interval, 3);
        assert_eq!(config.monitor.error_backoff, 5);
        assert_eq!(config.monitor.matcher, MatcherKind::Exact);
        assert_eq!(config.lease.restore, RestorePolicy::Persist);
        assert_eq!(config.lease.default_minutes, 60);
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let mut config = AppLockerConfig::default();
        config.monitor.poll_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_wide_totp_window() {
        let mut config = AppLockerConfig::default();
        config.auth.totp_window = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_recovery_keys() {
        let mut config = AppLockerConfig::default();
        config.auth.recovery_key_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config =
            AppLockerConfig::load_or_default(&temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.monitor.poll_interval, 2);
    }

    #[test]
    fn save_and_load_preserves_settings() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = AppLockerConfig::default();
        config.data_dir = Some(temp_dir.path().join("data"));
        config.delivery.command = vec!["/usr/sbin/sendmail".to_string(), "-t".to_string()];
        config.save(&path).unwrap();

        let loaded = AppLockerConfig::load(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.delivery.command, config.delivery.command);
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = AppLockerConfig {
            data_dir: Some(PathBuf::from("/tmp/app-locker-test")),
            ..Default::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/app-locker-test"));
    }
}
