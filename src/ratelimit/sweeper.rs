//! Background eviction of idle keys.
//!
//! Buckets are never refilled in the background, but a long-running service
//! still needs something to drop state for callers that went away. The
//! sweeper periodically calls [`Limiter::evict_idle`] on a shared limiter.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::limiter::Limiter;

/// Handle to a running sweeper task.
pub struct Sweeper {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a sweeper that evicts idle keys from `limiter` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<K>(limiter: Arc<Limiter<K>>, clock: Arc<dyn Clock>, interval: Duration) -> Self
    where
        K: Eq + Hash + Send + Sync + 'static,
    {
        let (stop, mut stopped) = oneshot::channel();

        info!(interval_ms = interval.as_millis() as u64, "Starting idle key sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let removed = limiter.evict_idle(clock.now());
                        debug!(removed, tracked = limiter.len(), "Sweep complete");
                    }
                }
            }

            debug!("Idle key sweeper stopped");
        });

        Self { stop, task }
    }

    /// Stop the sweeper and wait for its task to finish.
    pub async fn shutdown(self) {
        // The receiver is gone only if the task already exited.
        let _ = self.stop.send(());

        if let Err(e) = self.task.await {
            warn!(error = %e, "Idle key sweeper task failed");
        }
    }
}
