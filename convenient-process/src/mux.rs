//! Log Multiplexer
//!
//! Many units build at once, each with its own subprocess printing lines. The
//! multiplexer funnels them into one sink through a single channel and a single
//! drainer task, so lines are always written whole and each source's lines stay
//! in the order they were produced.
//!
//! `wait_for_log_end()` is the completion barrier: it returns only once every
//! registered source has finished and the drainer has written everything.

use crate::classify::Classifier;
use crate::log::{LogRecord, Severity, SourceId};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, trace, warn};

/// Most diagnostics kept per source.
pub const MAX_DIAGNOSTICS: usize = 200;

/// Destination of multiplexed records.
pub trait LogSink: Send + 'static {
    /// Write one record.
    fn write(&mut self, record: &LogRecord);

    /// Called when the channel is idle.
    fn flush(&mut self) {}
}

/// Emits each record as a `tracing` event at its severity.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&mut self, record: &LogRecord) {
        match record.severity {
            Severity::Error => error!(target: "build", "[{}] {}", record.source, record.text),
            Severity::Warning => warn!(target: "build", "[{}] {}", record.source, record.text),
            Severity::Info => info!(target: "build", "[{}] {}", record.source, record.text),
            Severity::Debug => debug!(target: "build", "[{}] {}", record.source, record.text),
        }
    }
}

/// Collects records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Records of one source, in write order.
    pub fn records_for(&self, source: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.source.as_str() == source)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn write(&mut self, record: &LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

#[derive(Debug, Default)]
struct Barrier {
    open_sources: usize,
    pending: usize,
}

impl Barrier {
    fn is_idle(&self) -> bool {
        self.open_sources == 0 && self.pending == 0
    }
}

#[derive(Debug)]
struct MuxInner {
    tx: mpsc::UnboundedSender<LogRecord>,
    classifier: Classifier,
    barrier: Mutex<Barrier>,
    idle: Notify,
}

impl MuxInner {
    fn update(&self, f: impl FnOnce(&mut Barrier)) {
        let idle = match self.barrier.lock() {
            Ok(mut barrier) => {
                f(&mut barrier);
                barrier.is_idle()
            }
            Err(poisoned) => {
                let mut barrier = poisoned.into_inner();
                f(&mut barrier);
                barrier.is_idle()
            }
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        match self.barrier.lock() {
            Ok(barrier) => barrier.is_idle(),
            Err(poisoned) => poisoned.into_inner().is_idle(),
        }
    }
}

/// Fan-in point for the output of all running units.
#[derive(Debug, Clone)]
pub struct LogMultiplexer {
    inner: Arc<MuxInner>,
}

impl LogMultiplexer {
    /// Start a multiplexer writing into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: impl LogSink, classifier: Classifier) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MuxInner {
            tx,
            classifier,
            barrier: Mutex::new(Barrier::default()),
            idle: Notify::new(),
        });

        tokio::spawn(drain(rx, Box::new(sink), Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Open a new source.
    pub fn register(&self, id: impl Into<SourceId>) -> LogSource {
        let id = id.into();
        self.inner.update(|barrier| barrier.open_sources += 1);
        trace!(source = %id, "Registered log source");
        LogSource {
            id,
            next_seq: 0,
            diagnostics: Vec::new(),
            fatal: false,
            lines: 0,
            inner: self.inner.clone(),
        }
    }

    /// Block until every registered source finished and every record was
    /// written to the sink.
    pub async fn wait_for_log_end(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a wakeup in between is not lost.
            notified.as_mut().enable();

            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Classification rules in use.
    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<LogRecord>,
    mut sink: Box<dyn LogSink>,
    inner: std::sync::Weak<MuxInner>,
) {
    while let Some(record) = rx.recv().await {
        sink.write(&record);
        if rx.is_empty() {
            sink.flush();
        }
        if let Some(inner) = inner.upgrade() {
            inner.update(|barrier| barrier.pending = barrier.pending.saturating_sub(1));
        }
    }
    sink.flush();
}

/// What a finished source reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSummary {
    /// Lines classified Warning or above, capped at [`MAX_DIAGNOSTICS`].
    pub diagnostics: Vec<LogRecord>,
    /// Whether any line matched a fatal rule.
    pub fatal: bool,
    /// Number of lines emitted.
    pub lines: u64,
}

/// Writing end for one producer.
///
/// Closed when finished or dropped; the barrier waits for every open source.
#[derive(Debug)]
pub struct LogSource {
    id: SourceId,
    next_seq: u64,
    diagnostics: Vec<LogRecord>,
    fatal: bool,
    lines: u64,
    inner: Arc<MuxInner>,
}

impl LogSource {
    /// Source identity.
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    /// Classify and emit one line of subprocess output.
    pub fn emit(&mut self, text: impl Into<String>) -> Severity {
        let text = text.into();
        let (severity, fatal) = self.inner.classifier.classify(&text);
        self.push(severity, fatal, text);
        severity
    }

    /// Emit an orchestrator message with a fixed severity, bypassing the rules.
    pub fn note(&mut self, severity: Severity, text: impl Into<String>) {
        self.push(severity, false, text.into());
    }

    fn push(&mut self, severity: Severity, fatal: bool, text: String) {
        let record = LogRecord {
            source: self.id.clone(),
            severity,
            text,
            seq: self.next_seq,
            fatal,
        };
        self.next_seq += 1;
        self.lines += 1;
        self.fatal |= fatal;

        if severity >= Severity::Warning && self.diagnostics.len() < MAX_DIAGNOSTICS {
            self.diagnostics.push(record.clone());
        }

        self.inner.update(|barrier| barrier.pending += 1);
        if self.inner.tx.send(record).is_err() {
            // Drainer is gone; nothing will ever consume this record.
            self.inner
                .update(|barrier| barrier.pending = barrier.pending.saturating_sub(1));
        }
    }

    /// Whether a fatal diagnostic was seen so far.
    pub fn saw_fatal(&self) -> bool {
        self.fatal
    }

    /// Close the source and collect its diagnostics.
    pub fn finish(mut self) -> SourceSummary {
        SourceSummary {
            diagnostics: std::mem::take(&mut self.diagnostics),
            fatal: self.fatal,
            lines: self.lines,
        }
    }
}

impl Drop for LogSource {
    fn drop(&mut self) {
        trace!(source = %self.id, lines = self.lines, "Closed log source");
        self.inner
            .update(|barrier| barrier.open_sources = barrier.open_sources.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequence_numbers_per_source() {
        let sink = MemorySink::new();
        let mux = LogMultiplexer::new(sink.clone(), Classifier::default());

        let mut a = mux.register("a");
        let mut b = mux.register("b");
        a.emit("one");
        b.emit("uno");
        a.emit("two");
        a.finish();
        b.finish();
        mux.wait_for_log_end().await;

        let seqs: Vec<u64> = sink.records_for("a").iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(sink.records_for("b")[0].text, "uno");
    }

    #[tokio::test]
    async fn test_barrier_waits_for_open_source() {
        let sink = MemorySink::new();
        let mux = LogMultiplexer::new(sink.clone(), Classifier::default());
        let mut source = mux.register("slow");

        let waiter = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.wait_for_log_end().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        source.emit("last words");
        drop(source);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_multiplexer_returns_immediately() {
        let mux = LogMultiplexer::new(MemorySink::new(), Classifier::default());
        tokio::time::timeout(Duration::from_millis(100), mux.wait_for_log_end())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_summary_collects_diagnostics() {
        let mux = LogMultiplexer::new(MemorySink::new(), Classifier::default());
        let mut source = mux.register("board:ro");
        source.emit("compiling");
        source.emit("foo.c:1: warning: unused");
        source.emit("devicetree error: missing node");
        source.note(Severity::Info, "devicetree error in a note is not classified");
        assert!(source.saw_fatal());

        let summary = source.finish();
        assert!(summary.fatal);
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.diagnostics.len(), 2);
        assert_eq!(summary.diagnostics[1].severity, Severity::Error);
        mux.wait_for_log_end().await;
    }
}
