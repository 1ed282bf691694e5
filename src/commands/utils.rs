use anyhow::{Context, Result};
use std::io::{BufRead, Write};

use app_locker::auth::{Enrollment, delivery};
use app_locker::config::LoggingConfig;
use app_locker::{AppLockerConfig, Engine};

/// Initialize logging
///
/// `RUST_LOG` wins, then `--verbose`, then `logging.level`. Logs go to
/// stderr so the console prompt stays readable, and are also appended to
/// `logging.file` when set.
pub fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { logging.level.as_str() };

    let file_layer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Open the engine with the configured delivery channel
pub fn open_engine(config: &AppLockerConfig) -> Result<Engine> {
    let channel = delivery::from_settings(&config.delivery, &config.reset);
    Engine::open(config.clone(), channel)
}

/// Use `given` or ask for a value on stdin
pub fn value_or_prompt(given: Option<String>, prompt: &str) -> Result<String> {
    if let Some(value) = given {
        return Ok(value);
    }

    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;

    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("no value entered");
    }
    Ok(value)
}

/// Show a new enrollment. The secret and keys are never shown again.
pub fn print_enrollment(enrollment: &Enrollment) {
    println!("✓ Authenticator enrolled for {}", enrollment.identity);
    println!();
    println!("Add this account to your authenticator app:");
    println!("  Secret: {}", enrollment.secret);
    println!("  URI:    {}", enrollment.provisioning_uri);
    println!();
    println!("Recovery keys (each works once; store them somewhere safe):");
    for (i, key) in enrollment.recovery_keys.iter().enumerate() {
        println!("  {}. {}", i + 1, key);
    }
}
