//! Reporting sinks
//!
//! The proxy hands every finished call to a [`UsageSink`]. Sinks must not
//! block: [`Reporter`] queues events on an unbounded channel and delivers them
//! to a [`Collector`] from a single background worker, in submission order.

use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow};
use futures::{FutureExt, future::BoxFuture};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use usagetap_common::UsageEvent;

use crate::telemetry;

/// Log target carrying serialized events from [`LogCollector`].
pub const EVENTS_TARGET: &str = "usagetap::events";

/// Destination for usage events. Must return without blocking.
pub trait UsageSink: Send + Sync {
    fn report_usage(&self, event: UsageEvent) -> Result<()>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl UsageSink for NoopSink {
    fn report_usage(&self, _event: UsageEvent) -> Result<()> {
        Ok(())
    }
}

/// Keeps events in memory. Also usable as a [`Collector`].
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<UsageEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, event: UsageEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event buffer poisoned"))?
            .push(event);
        Ok(())
    }
}

impl UsageSink for MemorySink {
    fn report_usage(&self, event: UsageEvent) -> Result<()> {
        self.push(event)
    }
}

impl<S: UsageSink + ?Sized> UsageSink for Arc<S> {
    fn report_usage(&self, event: UsageEvent) -> Result<()> {
        (**self).report_usage(event)
    }
}

/// Remote end of a [`Reporter`], driven only by its worker.
pub trait Collector: Send + Sync + 'static {
    fn send(&self, event: UsageEvent) -> BoxFuture<'_, Result<()>>;
}

impl Collector for MemorySink {
    fn send(&self, event: UsageEvent) -> BoxFuture<'_, Result<()>> {
        let result = self.push(event);
        async move { result }.boxed()
    }
}

/// Logs each event as JSON under [`EVENTS_TARGET`].
pub struct LogCollector {
    masked_key: String,
}

impl LogCollector {
    pub fn new(api_key: &str) -> Self {
        Self {
            masked_key: mask_api_key(api_key),
        }
    }
}

impl Collector for LogCollector {
    fn send(&self, event: UsageEvent) -> BoxFuture<'_, Result<()>> {
        async move {
            let json = serde_json::to_string(&event)?;
            info!(target: EVENTS_TARGET, "key={} {}", self.masked_key, json);
            Ok(())
        }
        .boxed()
    }
}

/// Keep the first and last four characters of long keys.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

enum Command {
    Event(Box<UsageEvent>),
    Flush(oneshot::Sender<()>),
}

/// Background delivery of events to a [`Collector`].
///
/// The worker runs on the current tokio runtime when there is one, otherwise
/// on a dedicated thread with its own single-threaded runtime. It stops once
/// every `Reporter` handle is dropped and the queue is drained.
#[derive(Clone, Debug)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<Command>,
}

impl Reporter {
    pub fn spawn(collector: Arc<dyn Collector>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = run_worker(collector, rx);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(worker);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("usagetap-reporter".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(rt) => rt.block_on(worker),
                            Err(e) => warn!("Failed to start reporter runtime: {}", e),
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn reporter thread: {}", e);
                }
            }
        }

        Self { tx }
    }

    /// Wait until every event submitted before this call has been delivered.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| anyhow!("usage reporter is not running"))?;
        done_rx
            .await
            .map_err(|_| anyhow!("usage reporter stopped before flushing"))
    }
}

impl UsageSink for Reporter {
    fn report_usage(&self, event: UsageEvent) -> Result<()> {
        self.tx
            .send(Command::Event(Box::new(event)))
            .map_err(|_| anyhow!("usage reporter is not running"))
    }
}

async fn run_worker(collector: Arc<dyn Collector>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => {
                telemetry::record_usage_event(&event);
                match AssertUnwindSafe(collector.send(*event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to deliver usage event: {:#}", e),
                    Err(_) => warn!("Usage collector panicked while delivering an event"),
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Usage reporter stopped");
}
