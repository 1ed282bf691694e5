//! Interactive prompt used by `app-locker run`

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::AuthMethod;
use crate::engine::Engine;
use crate::lease::LeaseMode;

const HELP: &str = "\
Commands:
  list                      Show protected applications
  unlock <app> [minutes]    Unlock with an authenticator code or recovery key
  unlock-pin <app> [min]    Unlock with the PIN
  session                   Unlock every application until lock-session
  lock-session              End a session unlock
  lock <app>                Lock an application now
  remove <app>              Stop protecting an application
  help                      Show this help
  quit                      Stop app-locker
";

/// Longest unlock the console will grant (one week)
const MAX_UNLOCK_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    List,
    Unlock { app: String, minutes: Option<u64> },
    UnlockPin { app: String, minutes: Option<u64> },
    Session,
    LockSession,
    Lock(String),
    Remove(String),
    Help,
    Quit,
}

fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Command::Empty);
    };
    let rest: Vec<&str> = words.collect();

    let app = |rest: &[&str]| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("usage: {} <app>", verb))
        } else {
            Ok(rest.join(" "))
        }
    };

    // "Google Chrome 30" -> ("Google Chrome", Some(30))
    let app_and_minutes = |rest: &[&str]| -> Result<(String, Option<u64>), String> {
        match rest.split_last() {
            Some((last, head)) if !head.is_empty() => match last.parse::<u64>() {
                Ok(0) => Err("minutes must be at least 1".to_string()),
                Ok(minutes) if minutes > MAX_UNLOCK_MINUTES => Err(format!(
                    "minutes must be at most {} (one week)",
                    MAX_UNLOCK_MINUTES
                )),
                Ok(minutes) => Ok((head.join(" "), Some(minutes))),
                Err(_) => Ok((rest.join(" "), None)),
            },
            _ => Ok((app(rest)?, None)),
        }
    };

    match verb.to_ascii_lowercase().as_str() {
        "list" | "ls" | "status" => Ok(Command::List),
        "unlock" => {
            let (app, minutes) = app_and_minutes(&rest)?;
            Ok(Command::Unlock { app, minutes })
        }
        "unlock-pin" => {
            let (app, minutes) = app_and_minutes(&rest)?;
            Ok(Command::UnlockPin { app, minutes })
        }
        "session" => Ok(Command::Session),
        "lock-session" => Ok(Command::LockSession),
        "lock" => Ok(Command::Lock(app(&rest)?)),
        "remove" => Ok(Command::Remove(app(&rest)?)),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{}' (try 'help')", other)),
    }
}

/// Prompt loop over `input`/`output` until `quit` or end of input
pub async fn run<R, W>(engine: Arc<Engine>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    output
        .write_all(b"app-locker console. Type 'help' for commands.\n")
        .await?;

    loop {
        output.write_all(b"app-locker> ").await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await.context("Failed to read console input")? else {
            break;
        };

        let command = match parse(&line) {
            Ok(command) => command,
            Err(message) => {
                output.write_all(format!("{}\n", message).as_bytes()).await?;
                continue;
            }
        };

        let reply = match command {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Help => HELP.to_string(),
            Command::List => list(&engine),
            Command::Unlock { app, minutes } => {
                let Some(code) = prompt(&mut lines, &mut output, "Authenticator code or recovery key: ").await? else {
                    break;
                };
                match engine.unlock(&app, &code, minutes.map(|m| Duration::from_secs(m * 60))) {
                    Ok((expires_at, method)) => {
                        format!("{} unlocked until {}{}\n", app, clock(expires_at), method_note(method))
                    }
                    Err(e) => format!("Unlock failed: {:#}\n", e),
                }
            }
            Command::UnlockPin { app, minutes } => {
                let Some(pin) = prompt(&mut lines, &mut output, "PIN: ").await? else {
                    break;
                };
                match engine.unlock_with_pin(&app, &pin, minutes.map(|m| Duration::from_secs(m * 60))) {
                    Ok(expires_at) => format!("{} unlocked until {}\n", app, clock(expires_at)),
                    Err(e) => format!("Unlock failed: {:#}\n", e),
                }
            }
            Command::Session => {
                let Some(code) = prompt(&mut lines, &mut output, "Authenticator code or recovery key: ").await? else {
                    break;
                };
                match engine.unlock_session(&code) {
                    Ok(method) => format!(
                        "Session unlocked: all applications allowed until 'lock-session'{}\n",
                        method_note(method)
                    ),
                    Err(e) => format!("Unlock failed: {:#}\n", e),
                }
            }
            Command::LockSession => {
                engine.lock_session();
                "Session locked\n".to_string()
            }
            Command::Lock(app) => match engine.lock_now(&app) {
                Ok(()) => format!("{} locked\n", app),
                Err(e) => format!("Lock failed: {:#}\n", e),
            },
            Command::Remove(app) => {
                let Some(code) = prompt(&mut lines, &mut output, "Authenticator code or recovery key: ").await? else {
                    break;
                };
                match engine.unprotect(&app, &code) {
                    Ok(method) => format!("{} is no longer protected{}\n", app, method_note(method)),
                    Err(e) => format!("Remove failed: {:#}\n", e),
                }
            }
        };

        output.write_all(reply.as_bytes()).await?;
    }

    output.write_all(b"Goodbye\n").await?;
    output.flush().await?;
    Ok(())
}

async fn prompt<R, W>(
    lines: &mut tokio::io::Lines<R>,
    output: &mut W,
    label: &str,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(label.as_bytes()).await?;
    output.flush().await?;
    Ok(lines
        .next_line()
        .await
        .context("Failed to read console input")?
        .map(|line| line.trim().to_string()))
}

fn list(engine: &Engine) -> String {
    let status = engine.status();
    if status.is_empty() {
        return "No protected applications. Add one with `app-locker protect <APP>`.\n".to_string();
    }

    let width = status
        .iter()
        .map(|s| s.app_identifier.chars().count())
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    for app in status {
        let state = match (app.locked, app.lease) {
            (_, LeaseMode::Session) => "unlocked (session)".to_string(),
            (false, LeaseMode::Temporary { expires_at }) => format!(
                "unlocked for {} (until {})",
                format_duration(expires_at - Utc::now()),
                clock(expires_at)
            ),
            (true, _) => "locked".to_string(),
            (false, LeaseMode::None) => "unlocked".to_string(),
        };
        out.push_str(&format!("  {:<width$}  {}\n", app.app_identifier, state, width = width));
    }
    out
}

fn method_note(method: AuthMethod) -> String {
    match method {
        AuthMethod::Totp => String::new(),
        AuthMethod::RecoveryKey { remaining } => {
            format!(" (recovery key used, {} left)", remaining)
        }
    }
}

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M").to_string()
}

/// Format duration for display
pub fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
