//! Non-blocking [`TelemetrySink`] implementations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use contextloom_core::decision::{DecisionRecord, TelemetrySink};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::summary::CycleSummary;

// ── Channel ───────────────────────────────────────────────────────────────

/// Forwards records over a bounded channel. When the consumer falls
/// behind, records are dropped and counted instead of blocking assembly.
pub struct ChannelSink {
    tx: mpsc::Sender<DecisionRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DecisionRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Records lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, records: &[DecisionRecord]) {
        let mut lost = 0u64;
        for record in records {
            if self.tx.try_send(record.clone()).is_err() {
                lost += 1;
            }
        }
        if lost > 0 {
            let total = self.dropped.fetch_add(lost, Ordering::Relaxed) + lost;
            warn!(lost, total, "Telemetry channel full, dropping decision records");
        }
    }
}

// ── Memory ────────────────────────────────────────────────────────────────

/// Keeps the most recent `capacity` records for inspection.
pub struct MemorySink {
    records: RwLock<VecDeque<DecisionRecord>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the buffered records, oldest first.
    pub fn records(&self) -> Vec<DecisionRecord> {
        self.read().iter().cloned().collect()
    }

    /// Summary over everything currently buffered.
    pub fn summary(&self) -> CycleSummary {
        let records = self.records();
        CycleSummary::from_records(&records)
    }

    /// Remove and return all buffered records.
    pub fn drain(&self) -> Vec<DecisionRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.drain(..).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<DecisionRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, records: &[DecisionRecord]) {
        let mut buffer = self.records.write().unwrap_or_else(|e| e.into_inner());
        buffer.extend(records.iter().cloned());
        let excess = buffer.len().saturating_sub(self.capacity);
        if excess > 0 {
            buffer.drain(..excess);
        }
    }
}

// ── Tracing ───────────────────────────────────────────────────────────────

/// Logs each record at debug level and a one-line summary per cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, records: &[DecisionRecord]) {
        for record in records {
            debug!(
                item = %record.item_id,
                decision = ?record.decision,
                stage = ?record.stage,
                reason = %record.reason,
                token_delta = record.token_delta,
                tier = ?record.tier,
                "Context decision"
            );
        }
        let summary = CycleSummary::from_records(records);
        debug!(%summary, "Context cycle");
    }
}

// ── Fan-out ───────────────────────────────────────────────────────────────

/// Emits to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for FanoutSink {
    fn emit(&self, records: &[DecisionRecord]) {
        for sink in &self.sinks {
            sink.emit(records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contextloom_core::decision::{Decision, DecisionStage};
    use contextloom_core::item::ItemId;

    fn record(seq: usize, decision: Decision) -> DecisionRecord {
        DecisionRecord::new(DecisionStage::Assembler, ItemId::message(1, seq), decision, "test")
            .with_tokens(10)
    }

    #[tokio::test]
    async fn channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new(8);
        sink.emit(&[record(0, Decision::Included), record(1, Decision::Excluded)]);
        assert_eq!(rx.recv().await.unwrap().item_id, ItemId::message(1, 0));
        assert_eq!(rx.recv().await.unwrap().decision, Decision::Excluded);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, _rx) = ChannelSink::new(2);
        let records: Vec<_> = (0..5).map(|i| record(i, Decision::Included)).collect();
        sink.emit(&records);
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        sink.emit(&[record(0, Decision::Included)]);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn memory_sink_prunes_oldest() {
        let sink = MemorySink::new(3);
        let records: Vec<_> = (0..5).map(|i| record(i, Decision::Included)).collect();
        sink.emit(&records);
        let kept = sink.records();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].item_id, ItemId::message(1, 2));
        assert_eq!(kept[2].item_id, ItemId::message(1, 4));
    }

    #[test]
    fn memory_sink_drain_empties() {
        let sink = MemorySink::new(10);
        sink.emit(&[record(0, Decision::Bridged)]);
        assert_eq!(sink.summary().bridged, 1);
        assert_eq!(sink.drain().len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new(10));
        let b = Arc::new(MemorySink::new(10));
        let fanout = FanoutSink::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingSink));
        fanout.emit(&[record(0, Decision::Included)]);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
