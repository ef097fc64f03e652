//! Online/offline signal consumed by the manager.
//!
//! The detection mechanism is external; the manager only needs the current
//! value and a change notification, which maps onto a `tokio::sync::watch`
//! channel.

use tokio::sync::watch;
use tracing::info;

pub trait ConnectivitySignal: Send + Sync {
    /// Receiver that yields every change of the online flag.
    fn watch(&self) -> watch::Receiver<bool>;

    fn current(&self) -> bool {
        *self.watch().borrow()
    }
}

/// A settable connectivity source.
///
/// Hosts feed it from their platform reachability API; tests flip it by hand.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    /// Publish a new state. Repeated values do not notify.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            info!(connected, "connectivity changed");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivitySignal for ConnectivityMonitor {
    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn current(&self) -> bool {
        self.is_connected()
    }
}
