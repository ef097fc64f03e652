//! Execution contexts the throttler dispatches onto.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// A unit of synchronous work handed to a context.
pub type Block = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere a block can run.
///
/// The throttler keys its capacity on [`label`](ExecutionContext::label), so
/// two contexts with the same label share one lane.
pub trait ExecutionContext: Send + Sync {
    fn label(&self) -> &str;

    /// Run `block` at some point. Must not block the caller on the block's
    /// completion unless the context is inline.
    fn dispatch(&self, block: Block);
}

/// Runs blocks immediately on the calling thread.
#[derive(Debug, Clone)]
pub struct InlineContext {
    label: String,
}

impl InlineContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ExecutionContext for InlineContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, block: Block) {
        block();
    }
}

/// Spawns every block as its own blocking task; blocks may run concurrently.
#[derive(Debug, Clone)]
pub struct TokioContext {
    label: String,
    handle: Handle,
}

impl TokioContext {
    pub fn new(label: impl Into<String>, handle: Handle) -> Self {
        Self {
            label: label.into(),
            handle,
        }
    }

    /// Bind to the runtime of the calling task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] outside a tokio runtime.
    pub fn current(label: impl Into<String>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Other(format!("no tokio runtime for execution context: {e}")))?;
        Ok(Self::new(label, handle))
    }
}

impl ExecutionContext for TokioContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, block: Block) {
        self.handle.spawn_blocking(block);
    }
}

/// Runs blocks one at a time, in dispatch order, on a single worker task.
#[derive(Debug, Clone)]
pub struct SerialContext {
    label: String,
    tx: mpsc::UnboundedSender<Block>,
}

impl SerialContext {
    /// Start the worker on `handle`. It exits once every clone is dropped.
    pub fn new(label: impl Into<String>, handle: &Handle) -> Self {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Block>();

        let worker_label = label.clone();
        handle.spawn(async move {
            while let Some(block) = rx.recv().await {
                // Run off the async worker threads, and wait so order holds.
                if tokio::task::spawn_blocking(block).await.is_err() {
                    debug!(context = %worker_label, "serial block panicked");
                }
            }
            debug!(context = %worker_label, "serial context closed");
        });

        Self { label, tx }
    }
}

impl ExecutionContext for SerialContext {
    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, block: Block) {
        if self.tx.send(block).is_err() {
            debug!(context = %self.label, "serial worker gone, block discarded");
        }
    }
}
