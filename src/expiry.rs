//! Background expiry of stale pending writes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cache::WriteBackCache;

/// Handle to the periodic stale-write sweep.
///
/// The sweep only expires abandoned pending writes; it never drains the
/// queue — draining stays an explicit collaborator action (see
/// [`WriteBackCache::should_sync`]). The task is tied to this handle:
/// `stop` shuts it down and waits for it to exit, so embedding services get
/// deterministic teardown.
pub struct ExpiryTask {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

impl ExpiryTask {
  /// Spawn the sweep on the cache's configured interval.
  pub fn spawn(cache: Arc<WriteBackCache>) -> Self {
    let interval = cache.config().expiry_interval();
    Self::with_interval(cache, interval)
  }

  /// Spawn the sweep on an explicit interval.
  pub fn with_interval(cache: Arc<WriteBackCache>, interval: Duration) -> Self {
    let (shutdown, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // interval yields immediately; consume that so sweeps start one
      // interval in
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = ticker.tick() => match cache.expire_stale() {
            Ok(0) => {}
            Ok(dropped) => debug!("Expired {} stale pending write(s)", dropped),
            Err(e) => warn!("Stale-write sweep failed: {}", e),
          },
          _ = rx.changed() => break,
        }
      }
    });

    Self { shutdown, handle }
  }

  /// Stop the sweep and wait for the task to exit.
  pub async fn stop(self) {
    let _ = self.shutdown.send(true);
    let _ = self.handle.await;
  }
}
