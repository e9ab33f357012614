//! Fan-out of metrics events to independent sinks.
//!
//! Every registered [`MetricsSink`] gets its own worker thread and FIFO
//! queue: a slow or failing sink can neither delay the poll loop nor starve
//! the other sinks, and each sink sees events in production order. Sink
//! errors are logged and swallowed.
//!
//! Two sinks ship with the library: [`LiveCache`] keeps the last snapshot
//! per channel for synchronous queries, [`HistoryLog`] appends timestamped
//! power and temperature entries.

use crate::metrics::{MetricsEvent, MetricsSnapshot, Reading};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// Errors a sink may return from [`MetricsSink::receive`].
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A consumer of metrics events.
///
/// Implementations run on their own worker thread; `receive` may block
/// without affecting polling.
pub trait MetricsSink: Send {
    fn name(&self) -> &str;
    fn receive(&mut self, event: &MetricsEvent) -> Result<(), SinkError>;
}

struct Worker {
    name: String,
    tx: mpsc::Sender<MetricsEvent>,
    handle: thread::JoinHandle<()>,
}

/// Delivers each published event to every registered sink.
///
/// Zero registered sinks is fine; `publish` is then a no-op.
#[derive(Default)]
pub struct SinkFanout {
    workers: Vec<Worker>,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink_count(&self) -> usize {
        self.workers.len()
    }

    /// Hands the sink to a dedicated worker thread.
    pub fn register(&mut self, mut sink: Box<dyn MetricsSink>) {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::channel::<MetricsEvent>();
        let worker_name = name.clone();
        let handle = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if let Err(error) = sink.receive(&event) {
                    warn!("sink '{worker_name}' failed to receive event: {error}");
                }
            }
            debug!("sink '{worker_name}' drained, worker exiting");
        });
        self.workers.push(Worker { name, tx, handle });
    }

    /// Queues the event for every sink. Never blocks.
    pub fn publish(&self, event: &MetricsEvent) {
        for worker in &self.workers {
            if worker.tx.send(event.clone()).is_err() {
                // Worker gone; its panic is reported on shutdown.
                warn!("sink '{}' is no longer accepting events", worker.name);
            }
        }
    }

    /// Closes all queues and waits until every sink has drained.
    pub fn shutdown(mut self) {
        for worker in self.workers.drain(..) {
            let Worker { name, tx, handle } = worker;
            drop(tx);
            if handle.join().is_err() {
                warn!("sink '{name}' worker panicked");
            }
        }
    }
}

/// Last snapshot per channel, queryable at any time.
///
/// Clones share the same storage; keep one handle and register
/// [`LiveCache::sink`] with the fan-out.
#[derive(Debug, Clone, Default)]
pub struct LiveCache {
    inner: Arc<Mutex<HashMap<String, MetricsSnapshot>>>,
}

impl LiveCache {
    pub fn latest(&self, channel: &str) -> Option<MetricsSnapshot> {
        self.lock().get(channel).cloned()
    }

    pub fn sink(&self) -> LiveCacheSink {
        LiveCacheSink {
            cache: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MetricsSnapshot>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LiveCacheSink {
    cache: LiveCache,
}

impl MetricsSink for LiveCacheSink {
    fn name(&self) -> &str {
        "live-cache"
    }

    fn receive(&mut self, event: &MetricsEvent) -> Result<(), SinkError> {
        if let MetricsEvent::Snapshot(snapshot) = event {
            self.cache
                .lock()
                .insert(snapshot.channel.clone(), snapshot.clone());
        }
        Ok(())
    }
}

/// One appended history record.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Unix seconds.
    pub time: i64,
    pub channel: String,
    pub value: HistoryValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryValue {
    PowerW(f64),
    TemperatureC(f64),
}

/// Append-only in-memory history of per-tick readings.
///
/// Clones share the same storage, like [`LiveCache`].
#[derive(Debug, Clone, Default)]
pub struct HistoryLog {
    inner: Arc<Mutex<Vec<HistoryEntry>>>,
}

impl HistoryLog {
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn sink(&self) -> HistorySink {
        HistorySink { log: self.clone() }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct HistorySink {
    log: HistoryLog,
}

impl MetricsSink for HistorySink {
    fn name(&self) -> &str {
        "history"
    }

    fn receive(&mut self, event: &MetricsEvent) -> Result<(), SinkError> {
        let MetricsEvent::Snapshot(snapshot) = event else {
            return Ok(());
        };
        let value = match &snapshot.reading {
            Reading::Production { power_w, .. } => HistoryValue::PowerW(*power_w),
            Reading::Temperature { celsius } => HistoryValue::TemperatureC(*celsius),
        };
        self.log.lock().push(HistoryEntry {
            time: snapshot.time.timestamp(),
            channel: snapshot.channel.clone(),
            value,
        });
        Ok(())
    }
}
