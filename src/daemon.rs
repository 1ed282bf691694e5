use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::console;
use crate::engine::Engine;
use crate::monitor::{self, DesktopNotifier, NotificationSink, ProcessMonitor, ProcessTable};
use crate::platform;

/// How `app-locker run` behaves
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Read commands from stdin
    pub console: bool,
}

/// Enforce locks with the real process table until Ctrl-C or `quit`
pub async fn run(engine: Arc<Engine>, options: RunOptions) -> Result<()> {
    let processes = platform::process_table()?;
    let notifier: Arc<dyn NotificationSink> = Arc::new(DesktopNotifier);

    if !options.console {
        return supervise(engine, processes, notifier, ctrl_c()).await;
    }

    let console_engine = Arc::clone(&engine);
    let console = tokio::spawn(async move {
        console::run(
            console_engine,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
        .await
    });

    let shutdown = async move {
        tokio::select! {
            _ = ctrl_c() => {}
            finished = console => match finished {
                Ok(Ok(())) => info!("Console closed"),
                Ok(Err(e)) => error!("Console failed: {:#}", e),
                Err(e) => error!("Console task failed: {}", e),
            },
        }
    };

    supervise(engine, processes, notifier, shutdown).await
}

/// Restore leases, start the background tasks, wait for `shutdown`, then
/// stop every task and wait for it to finish
pub async fn supervise<F>(
    engine: Arc<Engine>,
    processes: Arc<dyn ProcessTable>,
    notifier: Arc<dyn NotificationSink>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let config = engine.config().clone();

    let restored = engine
        .leases()
        .restore(config.lease.restore)
        .context("Failed to restore unlock state")?;
    if !restored.relocked.is_empty() {
        info!("Locked again after restart: {}", restored.relocked.join(", "));
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let monitor = ProcessMonitor::new(
        Arc::clone(engine.registry()),
        Arc::clone(engine.leases()),
        processes,
        config.monitor.matcher.build(),
        events_tx,
    )
    .with_intervals(config.monitor.poll_interval(), config.monitor.error_backoff());

    // The loop owns the only event sender, so the forwarder ends with it
    let monitor_handle = Arc::new(monitor).start();
    let forwarder = tokio::spawn(monitor::notify::forward_events(events_rx, notifier));

    let (sweep_stop, sweep_stopped) = watch::channel(false);
    let sweeper = tokio::spawn(sweep_reset_requests(
        Arc::clone(&engine),
        Duration::from_secs(config.reset.sweep_interval),
        sweep_stopped,
    ));

    info!(
        "app-locker running with {} protected application(s)",
        engine.registry().entries().len()
    );

    shutdown.await;
    info!("Shutting down");

    monitor_handle.stop().await?;
    let _ = sweep_stop.send(true);
    sweeper.await.context("Reset sweep task panicked")?;
    forwarder.await.context("Notification forwarder panicked")?;

    info!("app-locker stopped");
    Ok(())
}

async fn sweep_reset_requests(engine: Arc<Engine>, every: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(every) => {}
        }

        let sweeping = Arc::clone(&engine);
        match tokio::task::spawn_blocking(move || sweeping.resets().sweep_expired()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => debug!("Removed {} expired reset request(s)", removed),
            Ok(Err(e)) => warn!("Reset request sweep failed: {:#}", e),
            Err(e) => error!("Reset request sweep panicked: {}", e),
        }
    }
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted"),
        Err(e) => {
            // Without a signal handler the only way out is the console
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
