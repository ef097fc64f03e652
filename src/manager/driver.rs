//! Submission driver: periodic ticks, connectivity changes, shutdown.

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::OfflineRequestManager;
use crate::event::EventKind;

impl OfflineRequestManager {
    /// Run the driver loop until shutdown.
    ///
    /// `connectivity` is subscribed before the manager is handed out, so a
    /// change made right after `start()` returns is still observed.
    pub(super) async fn run_driver(&self, mut connectivity: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.inner.config.submission_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick is immediate; start() has already kicked a submission.
        ticker.tick().await;

        let mut watching = true;

        info!(
            interval_ms = self.inner.config.submission_interval.as_millis() as u64,
            "submission driver started"
        );

        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => {
                    info!("submission driver shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    debug!("periodic submission attempt");
                    self.attempt_submission();
                }
                changed = connectivity.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            let connected = *connectivity.borrow_and_update();
                            self.connectivity_changed(connected);
                        }
                        Err(_) => {
                            warn!("connectivity source closed, relying on periodic submission");
                            watching = false;
                        }
                    }
                }
            }
        }
    }

    fn connectivity_changed(&self, connected: bool) {
        info!(connected, "connectivity status changed");
        self.inner
            .events
            .emit(EventKind::ConnectivityChanged { connected });
        self.inner.observer.on_connectivity_change(connected);
        if connected {
            self.attempt_submission();
        }
    }
}
