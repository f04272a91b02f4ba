//! Repeating timer loops with explicit shutdown.
//!
//! Agent and supervisor cycles run on these loops in production; tests
//! call the cycle methods directly instead of waiting on wall-clock
//! timers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running repeating loop.
#[derive(Debug)]
pub struct LoopHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LoopHandle {
    /// Signals shutdown and waits for the current cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        info!(name = self.name, "loop stopped");
    }

    /// Signals shutdown without waiting.
    pub fn abort(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawns a loop that runs `cycle` every `interval` until stopped.
///
/// The first cycle runs immediately. A cycle in progress always finishes
/// before shutdown completes.
pub fn spawn_repeating<F, Fut>(name: &'static str, interval: Duration, mut cycle: F) -> LoopHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut watch_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cycle().await;
                }
                _ = watch_rx.changed() => {
                    debug!(name, "loop shutting down");
                    break;
                }
            }
        }
    });
    LoopHandle {
        name,
        shutdown,
        handle,
    }
}
