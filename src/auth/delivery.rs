use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::info;

use crate::config::{DeliverySettings, ResetSettings};

/// Out-of-band channel for reset codes
pub trait DeliveryChannel: Send + Sync {
    fn deliver_code(&self, identity: &str, code: &str) -> Result<()>;
}

/// Pick the delivery channel described by the configuration
pub fn from_settings(delivery: &DeliverySettings, reset: &ResetSettings) -> Box<dyn DeliveryChannel> {
    if delivery.command.is_empty() {
        Box::new(DisabledDelivery)
    } else {
        Box::new(CommandDelivery {
            command: delivery.command.clone(),
            from: delivery.from.clone(),
            ttl_minutes: reset.code_ttl_minutes,
        })
    }
}

/// Used when no delivery command is configured
pub struct DisabledDelivery;

impl DeliveryChannel for DisabledDelivery {
    fn deliver_code(&self, _identity: &str, _code: &str) -> Result<()> {
        anyhow::bail!("code delivery is not configured (set [delivery] command in the config file)")
    }
}

/// Pipes a plain-text email into a mail command such as `sendmail -t`
pub struct CommandDelivery {
    pub command: Vec<String>,
    pub from: String,
    pub ttl_minutes: u64,
}

impl CommandDelivery {
    fn message(&self, identity: &str, code: &str) -> String {
        format!(
            "From: {from}\n\
             To: {to}\n\
             Subject: AppLocker - Authentication Reset Request\n\
             \n\
             You have requested to reset the authenticator for AppLocker.\n\
             \n\
             Your reset code is: {code}\n\
             \n\
             This code expires in {ttl} minutes.\n\
             \n\
             To finish the reset, run:\n\
             \n\
             \x20   app-locker reset complete --identity {to} --code {code}\n\
             \n\
             and enroll the new secret in your authenticator app.\n\
             \n\
             If you did not request this reset, ignore this email.\n\
             \n\
             Generated at: {now}\n",
            from = self.from,
            to = identity,
            code = code,
            ttl = self.ttl_minutes,
            now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

impl DeliveryChannel for CommandDelivery {
    fn deliver_code(&self, identity: &str, code: &str) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .context("delivery command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start delivery command: {}", program))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .context("delivery command has no stdin")?;
            stdin
                .write_all(self.message(identity, code).as_bytes())
                .context("Failed to write reset email to delivery command")?;
        }

        let output = child
            .wait_with_output()
            .context("Failed to wait for delivery command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "delivery command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        info!("Reset code sent to {} via {}", identity, program);
        Ok(())
    }
}
