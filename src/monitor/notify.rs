use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use super::MonitorEvent;

/// Where user-facing notices go
pub trait NotificationSink: Send + Sync {
    fn notify_user(&self, message: &str) -> Result<()>;
}

/// Desktop notifications through the platform's notifier
pub struct DesktopNotifier;

impl NotificationSink for DesktopNotifier {
    fn notify_user(&self, message: &str) -> Result<()> {
        const TITLE: &str = "App Locked";

        #[cfg(target_os = "linux")]
        {
            use std::process::Command;
            Command::new("notify-send")
                .arg(TITLE)
                .arg(message)
                .arg("--urgency=critical")
                .arg("--icon=dialog-warning")
                .output()?;
        }

        #[cfg(target_os = "macos")]
        {
            use std::process::Command;
            let script = format!(
                "display notification \"{}\" with title \"{}\" sound name \"Glass\"",
                message.replace('\\', "\\\\").replace('"', "\\\""),
                TITLE
            );
            Command::new("osascript").arg("-e").arg(&script).output()?;
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            warn!("{}: {}", TITLE, message);
        }

        Ok(())
    }
}

/// Text shown to the user for a monitor event
pub fn describe(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::Blocked { app, .. } => format!(
            "{} is locked by AppLocker. Unlock it with your authenticator code.",
            app
        ),
    }
}

/// Drain monitor events into a notification sink until the channel closes
///
/// Runs the sink on the blocking pool so a slow notifier never stalls the
/// runtime.
pub async fn forward_events<S>(mut events: UnboundedReceiver<MonitorEvent>, sink: std::sync::Arc<S>)
where
    S: NotificationSink + ?Sized + 'static,
{
    while let Some(event) = events.recv().await {
        let message = describe(&event);
        let sink = std::sync::Arc::clone(&sink);
        let delivered = tokio::task::spawn_blocking(move || sink.notify_user(&message)).await;

        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to show notification: {:#}", e),
            Err(e) => warn!("Notification task failed: {}", e),
        }
    }

    info!("Notification forwarder stopped");
}
