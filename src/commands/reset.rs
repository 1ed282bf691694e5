use anyhow::Result;

use app_locker::AppLockerConfig;

use super::utils::{open_engine, print_enrollment};

/// Email a reset code to the enrolled identity
pub fn request(config: &AppLockerConfig, identity: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let expires_at = engine.request_reset(identity)?;

    println!("✓ Reset code sent to {}", identity.trim());
    println!(
        "  It expires at {}.",
        expires_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
    );
    println!();
    println!("Then run: app-locker reset complete --identity {} --code <CODE>", identity.trim());
    Ok(())
}

/// Verify the emailed code and enroll a new authenticator
pub fn complete(config: &AppLockerConfig, identity: &str, code: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let enrollment = engine.complete_reset(identity, code)?;

    println!("✓ Reset code accepted; previous authenticator and recovery keys revoked");
    println!();
    print_enrollment(&enrollment);
    Ok(())
}
