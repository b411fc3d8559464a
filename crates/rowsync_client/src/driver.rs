//! Background sync loop.

use crate::client::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Handle to a running background sync loop.
///
/// The loop syncs every interval. After a failure it backs off according to
/// the client's retry configuration before trying again.
#[derive(Debug)]
pub struct SyncLoop {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SyncLoop {
    /// Spawns the loop on the current tokio runtime.
    pub fn spawn(client: Arc<Client>, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(client, interval, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Spawns the loop if the client's configuration sets a sync interval.
    pub fn from_config(client: Arc<Client>) -> Option<Self> {
        let interval = client.config().sync_interval?;
        Some(Self::spawn(client, interval))
    }

    /// Returns true if the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the loop and waits for the running cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sync loop ended abnormally");
        }
    }
}

async fn run(client: Arc<Client>, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
    info!(interval_ms = interval.as_millis() as u64, "sync loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let cycle = Arc::clone(&client);
        match tokio::task::spawn_blocking(move || cycle.sync()).await {
            Ok(Ok(result)) => {
                failures = 0;
                debug!(pulled = result.pulled, pushed = result.pushed, "background sync");
            }
            Ok(Err(e)) => {
                failures = failures.saturating_add(1);
                let delay = client.config().retry.delay_for_attempt(failures);
                warn!(
                    error = %e,
                    failures,
                    backoff_ms = delay.as_millis() as u64,
                    "background sync failed"
                );
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "sync task panicked");
                break;
            }
        }
    }
    info!("sync loop stopped");
}
