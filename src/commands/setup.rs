use anyhow::{Context, Result};
use std::path::Path;

use app_locker::AppLockerConfig;
use app_locker::config::EXAMPLE_CONFIG;

use super::utils::{open_engine, print_enrollment, value_or_prompt};

/// Write the commented example configuration
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    app_locker::platform::common::atomic_write(path, EXAMPLE_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("✓ Example configuration written to: {}", path.display());
    Ok(())
}

/// First-time authenticator enrollment
pub fn setup(config: &AppLockerConfig, identity: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let enrollment = engine.setup(identity)?;

    print_enrollment(&enrollment);
    println!();
    println!("Next steps:");
    println!("  1. Protect an application:  app-locker protect <APP>");
    println!("  2. Start enforcing:         app-locker run");
    Ok(())
}

/// Set the legacy PIN
pub fn set_pin(config: &AppLockerConfig, code: Option<String>) -> Result<()> {
    let engine = open_engine(config)?;
    let code = value_or_prompt(code, "Authenticator code or recovery key: ")?;
    let pin = value_or_prompt(None, "New PIN (4-12 digits): ")?;

    engine.set_pin(&code, &pin)?;
    println!("✓ PIN updated");
    Ok(())
}
