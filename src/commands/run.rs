use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use app_locker::AppLockerConfig;
use app_locker::daemon::{self, RunOptions};

use super::utils::open_engine;

/// Enforce locks in the foreground
pub fn run(config: &AppLockerConfig, no_console: bool) -> Result<()> {
    let engine = Arc::new(open_engine(config)?);

    if !engine.credentials().is_configured()? {
        println!("Warning: no authenticator is enrolled; locked applications cannot be unlocked.");
        println!("Run `app-locker setup --identity <EMAIL>` first.");
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(daemon::run(
        engine,
        RunOptions {
            console: !no_console,
        },
    ));

    // A pending console read would otherwise keep the runtime alive
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
