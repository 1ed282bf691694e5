use anyhow::Result;

use app_locker::AppLockerConfig;

use super::utils::{open_engine, value_or_prompt};

/// List installed applications
pub fn apps(filter: Option<&str>) -> Result<()> {
    let installed = app_locker::platform::installed_apps()?;
    let filter = filter.map(str::to_lowercase);

    let matching: Vec<&String> = installed
        .iter()
        .filter(|name| {
            filter
                .as_deref()
                .is_none_or(|f| name.to_lowercase().contains(f))
        })
        .collect();

    if matching.is_empty() {
        println!("No installed applications found");
        return Ok(());
    }

    for name in &matching {
        println!("  {}", name);
    }
    println!();
    println!("{} application(s)", matching.len());
    Ok(())
}

/// Protect applications
pub fn protect(config: &AppLockerConfig, apps: &[String]) -> Result<()> {
    let engine = open_engine(config)?;

    if !engine.credentials().is_configured()? {
        println!("Note: no authenticator is enrolled yet; run `app-locker setup` before you need to unlock.");
    }

    for app in apps {
        if engine.protect(app)? {
            println!("✓ Protecting {}", app.trim());
        } else {
            println!("✓ {} is already protected (locked)", app.trim());
        }
    }
    Ok(())
}

/// Stop protecting an application
pub fn unprotect(config: &AppLockerConfig, app: &str, code: Option<String>) -> Result<()> {
    let engine = open_engine(config)?;
    let code = value_or_prompt(code, "Authenticator code or recovery key: ")?;

    engine.unprotect(app, &code)?;
    println!("✓ {} is no longer protected", app.trim());
    Ok(())
}

/// Show protected applications
pub fn list(config: &AppLockerConfig) -> Result<()> {
    let engine = open_engine(config)?;
    let status = engine.status();

    if status.is_empty() {
        println!("No protected applications");
        return Ok(());
    }

    for app in status {
        // Lease timers live in the running daemon; only the registry is known here
        let state = if app.locked { "locked" } else { "unlocked" };
        println!("  {:<32} {}", app.app_identifier, state);
    }
    Ok(())
}
