//! # outbox-rs
//!
//! Durable, connectivity-aware outbox for client-originated requests.
//!
//! [`OfflineRequestManager`] owns a FIFO queue of units of work, persists it
//! after every change, and retries submission periodically and whenever
//! connectivity returns. [`Throttler`] bounds how many blocks may be
//! outstanding on an execution context, with completion acknowledged by the
//! caller rather than inferred.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod manager;
pub mod model;
pub mod observer;
pub mod policy;
pub mod request;
pub mod store;
pub mod telemetry;
pub mod throttle;

pub use connectivity::{ConnectivityMonitor, ConnectivitySignal};
pub use error::{Error, RequestError, Result};
pub use manager::{ManagerBuilder, ManagerConfig, OfflineRequestManager, RequestContext};
pub use model::{Primitive, Record, UnitId, UnitSnapshot, UnitState};
pub use observer::QueueObserver;
pub use policy::{AdmissionPredicate, AdmissionSwitch, RetryPolicy};
pub use request::{OfflineRequest, UnitFactory};
pub use store::{PersistenceStore, StoredUnit};
pub use throttle::{ScheduledAction, Throttler};
