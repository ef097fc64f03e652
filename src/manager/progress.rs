//! Coalescing of aggregate-progress notifications.
//!
//! The first update in a quiet period goes out immediately. Updates arriving
//! within `interval` of the last notification collapse into one trailing
//! notification, which reads the aggregate fresh when it fires.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Gate {
    /// Notify now.
    Open,
    /// Schedule one trailing notification after the delay.
    Trailing(Duration),
    /// A trailing notification is already scheduled.
    Coalesced,
}

#[derive(Debug, Default)]
struct GateState {
    last_notified: Option<Instant>,
    trailing_scheduled: bool,
}

#[derive(Debug)]
pub(crate) struct ProgressGate {
    interval: Duration,
    state: Mutex<GateState>,
}

impl ProgressGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(GateState::default()),
        }
    }

    pub fn admit(&self) -> Gate {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.trailing_scheduled {
            return Gate::Coalesced;
        }
        match state.last_notified {
            Some(last) if now.duration_since(last) < self.interval => {
                state.trailing_scheduled = true;
                Gate::Trailing(self.interval - now.duration_since(last))
            }
            _ => {
                state.last_notified = Some(now);
                Gate::Open
            }
        }
    }

    /// Record that the trailing notification went out.
    pub fn trailing_fired(&self) {
        let mut state = self.state.lock();
        state.trailing_scheduled = false;
        state.last_notified = Some(Instant::now());
    }
}
