//! outbox CLI: demo scenarios and queue inspection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use outbox_rs::config::Config;
use outbox_rs::manager::OfflineRequestManager;
use outbox_rs::telemetry::init_telemetry;
use outbox_rs::throttle::{ExecutionContext, SerialContext, Throttler, TokioContext};
use outbox_rs::{
    ConnectivityMonitor, OfflineRequest, QueueObserver, Record, RequestContext, RequestError,
    UnitId,
};
use tokio::runtime::Handle;

#[derive(Parser)]
#[command(name = "outbox", about = "Durable offline request queue")]
struct Cli {
    /// TOML config file; environment variables are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue simulated transfers from a task and a plain thread, then drain
    Demo {
        /// Units enqueued by each producer
        #[arg(long, default_value_t = 50)]
        per_producer: usize,
        /// Seconds to wait for the queue to drain
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Dispatch blocks through a throttler onto a concurrent and a serial context
    Throttle {
        #[arg(long, default_value_t = 12)]
        blocks: usize,
        /// Outstanding blocks allowed per context
        #[arg(long, default_value_t = 3)]
        capacity: usize,
    },
    /// Print the persisted queue
    Inspect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let guard = init_telemetry(config.telemetry_config("outbox"))?;

    let outcome = match cli.command {
        Command::Demo {
            per_producer,
            timeout,
        } => cmd_demo(&config, per_producer, Duration::from_secs(timeout)).await,
        Command::Throttle { blocks, capacity } => cmd_throttle(blocks, capacity).await,
        Command::Inspect => cmd_inspect(&config).await,
    };
    guard.force_flush();
    outcome
}

/// Simulated upload: a few chunks with progress, failing its first attempt
/// now and then.
struct DemoTransfer {
    index: i64,
    chunks: i64,
}

impl DemoTransfer {
    const KIND: &'static str = "demo_transfer";

    fn from_record(record: &Record) -> Option<Arc<dyn OfflineRequest>> {
        if record.get("kind")?.as_str()? != Self::KIND {
            return None;
        }
        Some(Arc::new(Self {
            index: record.get("index")?.as_i64()?,
            chunks: record.get("chunks")?.as_i64()?,
        }))
    }
}

#[async_trait]
impl OfflineRequest for DemoTransfer {
    fn to_record(&self) -> Option<Record> {
        let mut record = Record::new();
        record.insert("kind".into(), Self::KIND.into());
        record.insert("index".into(), self.index.into());
        record.insert("chunks".into(), self.chunks.into());
        Some(record)
    }

    async fn perform(&self, ctx: RequestContext) -> Result<(), RequestError> {
        for chunk in 1..=self.chunks {
            tokio::time::sleep(Duration::from_millis(15)).await;
            ctx.report_progress(chunk as f64 / self.chunks as f64);
            if self.index % 9 == 0 && ctx.attempt() == 1 && chunk == self.chunks / 2 {
                return Err(format!("transfer {} interrupted", self.index).into());
            }
        }
        Ok(())
    }
}

struct PrintObserver;

impl QueueObserver for PrintObserver {
    fn on_progress(&self, progress: f64) {
        tracing::debug!(progress, "aggregate progress");
    }

    fn on_connectivity_change(&self, connected: bool) {
        println!("connectivity: {}", if connected { "online" } else { "offline" });
    }

    fn on_unit_failed(&self, id: UnitId, _request: &dyn OfflineRequest, error: &outbox_rs::Error) {
        println!("unit {id} failed: {error}");
    }
}

async fn cmd_demo(config: &Config, per_producer: usize, timeout: Duration) -> anyhow::Result<()> {
    let store = config.open_store()?;
    let connectivity = Arc::new(ConnectivityMonitor::new(true));

    let mut manager_config = config.manager_config();
    manager_config.submission_interval = Duration::from_secs(1);

    let manager = OfflineRequestManager::builder(store, Arc::new(DemoTransfer::from_record))
        .connectivity(connectivity.clone())
        .observer(Arc::new(PrintObserver))
        .config(manager_config)
        .start()
        .await?;

    let restored = manager.pending_request_count();
    if restored > 0 {
        println!("restored {restored} unit(s) from a previous run");
    }

    let from_task = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for i in 0..per_producer {
                manager
                    .enqueue(DemoTransfer {
                        index: i as i64,
                        chunks: 4,
                    })
                    .await;
            }
        })
    };

    let from_thread = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            for i in 0..per_producer {
                manager.enqueue_blocking(DemoTransfer {
                    index: (per_producer + i) as i64,
                    chunks: 6,
                });
            }
        })
    };

    // Drop the connection briefly while the producers run.
    tokio::time::sleep(Duration::from_millis(200)).await;
    connectivity.set_connected(false);
    tokio::time::sleep(Duration::from_millis(800)).await;
    connectivity.set_connected(true);

    from_task.await?;
    tokio::task::spawn_blocking(move || from_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;

    let deadline = tokio::time::Instant::now() + timeout;
    while manager.pending_request_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            println!("timed out with {} unit(s) pending", manager.pending_request_count());
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!(
        "completed {}/{} (progress {:.0}%)",
        manager.completed_request_count(),
        manager.total_request_count(),
        manager.progress() * 100.0
    );
    manager.shutdown();
    Ok(())
}

async fn cmd_throttle(blocks: usize, capacity: usize) -> anyhow::Result<()> {
    let handle = Handle::current();
    let throttler = Throttler::new(capacity);
    let concurrent: Arc<dyn ExecutionContext> = Arc::new(TokioContext::new("concurrent", handle.clone()));
    let serial: Arc<dyn ExecutionContext> = Arc::new(SerialContext::new("serial", &handle));

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    for n in 0..blocks {
        let context = if n % 2 == 0 { &concurrent } else { &serial };
        let label = context.label().to_string();
        let action = throttler.execute(Arc::clone(context), move || {
            println!("block {n} running on {label}");
        });

        // Acknowledge on our own schedule, after the block has run.
        let ack = action.clone();
        let done_tx = done_tx.clone();
        let handle = handle.clone();
        action.on_block_called(move || {
            handle.spawn(async move {
                tokio::time::sleep(random_delay()).await;
                println!("block {n} done ({})", ack.identifier());
                ack.mark_done();
                let _ = done_tx.send(n);
            });
        });
    }
    drop(done_tx);

    println!(
        "scheduled {blocks} block(s): concurrent {} running / {} deferred, serial {} running / {} deferred",
        throttler.outstanding_count("concurrent"),
        throttler.deferred_count("concurrent"),
        throttler.outstanding_count("serial"),
        throttler.deferred_count("serial"),
    );

    let mut finished = 0;
    while done_rx.recv().await.is_some() {
        finished += 1;
    }
    println!("{finished} block(s) acknowledged");
    Ok(())
}

/// 50..250ms, drawn from a fresh v4 uuid.
fn random_delay() -> Duration {
    let byte = uuid::Uuid::new_v4().as_bytes()[0];
    Duration::from_millis(50 + u64::from(byte) * 200 / 255)
}

async fn cmd_inspect(config: &Config) -> anyhow::Result<()> {
    let store = config.open_store()?;
    let units = store.load().await?;

    if let Some(path) = config.resolved_store_path() {
        println!("store: {:?} at {}", config.store_backend, path.display());
    }
    if units.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{:<8}  {:<8}  {:<16}  RECORD", "ID", "ATTEMPTS", "ENQUEUED");
    println!("{}", "-".repeat(80));
    for unit in &units {
        println!(
            "{:<8}  {:<8}  {:<16}  {}",
            unit.id,
            unit.attempts,
            unit.enqueued_at.format("%Y-%m-%d %H:%M"),
            serde_json::to_string(&unit.record)?
        );
    }
    println!("\n{} unit(s)", units.len());
    Ok(())
}
