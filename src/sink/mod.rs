//! Durable Sink - write-behind queue in front of the remote store.
//!
//! Every accepted event is attempted against the store immediately; on any
//! failure it lands in the on-disk journal and a background drain retries
//! head-first every five seconds (with jitter) until the store accepts it.
//! Per-kind enqueue order is preserved: while older events of a kind are
//! journaled, newer ones of the same kind queue behind them instead of
//! jumping ahead.

mod journal;
mod store;

pub use journal::Journal;
pub use store::{EventStore, RemoteStore};

use crate::error::SinkError;
use crate::types::{unix_ts, AgentEvent, QueuedEvent};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DRAIN_BASE_MS: u64 = 5_000;
const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);
const PRESSURE_THRESHOLD: f64 = 0.8;

pub struct DurableSink<S: RemoteStore> {
    store: S,
    journal: Journal,
    queue: VecDeque<QueuedEvent>,
    next_sequence: u64,
    pressure_warned: bool,
}

impl<S: RemoteStore> DurableSink<S> {
    /// `backlog` is whatever the journal held at startup; delivery resumes
    /// from its head.
    pub fn new(store: S, journal: Journal, backlog: Vec<QueuedEvent>) -> Self {
        // Sequences must stay monotonic across restarts or idempotent
        // inserts would swallow fresh rows; seed from wall clock.
        let journal_max = backlog.iter().map(|e| e.sequence).max().unwrap_or(0);
        let next_sequence = (unix_ts() * 1_000).max(journal_max + 1);

        DurableSink {
            store,
            journal,
            queue: backlog.into(),
            next_sequence,
            pressure_warned: false,
        }
    }

    /// Consume events until the channel closes, draining the journal on a
    /// jittered interval. On shutdown the remaining channel backlog goes
    /// straight to the journal.
    pub async fn run(mut self, mut events: mpsc::Receiver<AgentEvent>, shutdown: Arc<AtomicBool>) {
        info!(queued = self.queue.len(), "durable sink running");
        // The drain timer lives outside the loop so a busy event stream
        // cannot starve it.
        let drain_timer = tokio::time::sleep(Duration::from_millis(jittered_drain_ms()));
        tokio::pin!(drain_timer);
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.accept(event, shutdown.load(Ordering::Relaxed)).await,
                    None => break,
                },
                _ = drain_timer.as_mut() => {
                    self.drain().await;
                    drain_timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + Duration::from_millis(jittered_drain_ms()));
                }
            }
        }

        // Channel closed: flush anything still queued in memory.
        info!(queued = self.queue.len(), "durable sink flushing");
        if !self.queue.is_empty() {
            self.drain().await;
        }
    }

    /// Accept one event: direct store write when its kind has no backlog,
    /// journal spill otherwise or on failure.
    pub async fn accept(&mut self, event: AgentEvent, skip_store: bool) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut queued = QueuedEvent::from_event(sequence, &event);

        let kind_blocked = self.queue.iter().any(|e| e.kind == queued.kind);
        if !kind_blocked && !skip_store {
            queued.attempts = 1;
            match tokio::time::timeout(COMMIT_TIMEOUT, self.store.commit(&queued)).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => debug!(sequence, error = %e, "direct store write failed, journaling"),
                Err(_) => debug!(sequence, "direct store write timed out, journaling"),
            }
        }

        match self.journal.append(&queued) {
            Ok(()) => {
                self.queue.push_back(queued);
                self.check_pressure();
            }
            Err(SinkError::JournalFull { bytes, cap }) => {
                warn!(sequence, bytes, cap, "journal full, event rejected");
            }
            Err(e) => error!(sequence, error = %e, "journal append failed, event lost"),
        }
    }

    /// Head-first journal drain; stops at the first failure so order is
    /// preserved. The journal file is rewritten once per batch.
    pub async fn drain(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let mut delivered = 0usize;
        while let Some(head) = self.queue.front_mut() {
            head.attempts += 1;
            let snapshot = head.clone();
            let result = tokio::time::timeout(COMMIT_TIMEOUT, self.store.commit(&snapshot)).await;
            match result {
                Ok(Ok(())) => {
                    self.queue.pop_front();
                    delivered += 1;
                }
                Ok(Err(e)) => {
                    debug!(error = %e, remaining = self.queue.len(), "journal drain stopped");
                    break;
                }
                Err(_) => {
                    debug!(remaining = self.queue.len(), "journal drain timed out");
                    break;
                }
            }
        }

        if delivered > 0 {
            info!(delivered, remaining = self.queue.len(), "journal drained");
            let remaining: Vec<QueuedEvent> = self.queue.iter().cloned().collect();
            if let Err(e) = self.journal.rewrite(&remaining) {
                error!(error = %e, "journal compaction failed");
            }
            let (bytes, cap) = self.journal.usage();
            if (bytes as f64) < (cap as f64) * PRESSURE_THRESHOLD {
                self.pressure_warned = false;
            }
        }
    }

    /// One warning event per upward crossing of 80% journal usage.
    fn check_pressure(&mut self) {
        let (bytes, cap) = self.journal.usage();
        if self.pressure_warned || (bytes as f64) < (cap as f64) * PRESSURE_THRESHOLD {
            return;
        }
        self.pressure_warned = true;
        warn!(bytes, cap, "journal above 80% of cap");

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let pressure = QueuedEvent::from_event(
            sequence,
            &AgentEvent::JournalPressure {
                bytes,
                cap,
                observed_at: unix_ts(),
            },
        );
        if let Err(e) = self.journal.append(&pressure) {
            debug!(error = %e, "pressure event not journaled");
        } else {
            self.queue.push_back(pressure);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

fn jittered_drain_ms() -> u64 {
    // 5 s ± 20%
    rand::thread_rng().gen_range(DRAIN_BASE_MS * 4 / 5..=DRAIN_BASE_MS * 6 / 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::types::EventKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Store fixture: rejects every commit while `online` is false.
    struct FlakyStore {
        online: Arc<AtomicBool>,
        committed: Arc<Mutex<Vec<QueuedEvent>>>,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn commit(&mut self, event: &QueuedEvent) -> Result<(), SinkError> {
            if !self.online.load(Ordering::Relaxed) {
                return Err(SinkError::StoreUnavailable("offline".to_string()));
            }
            self.committed.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn fixture(online: bool) -> (Arc<AtomicBool>, Arc<Mutex<Vec<QueuedEvent>>>, FlakyStore) {
        let online = Arc::new(AtomicBool::new(online));
        let committed = Arc::new(Mutex::new(Vec::new()));
        let store = FlakyStore {
            online: online.clone(),
            committed: committed.clone(),
        };
        (online, committed, store)
    }

    fn meter_event(new_value: u64) -> AgentEvent {
        AgentEvent::MeterChanged {
            asset_number: 10,
            machine_address: 1,
            meter_code: 0x11,
            old_value: new_value - 1,
            new_value,
            suspect: false,
            observed_at: 1700000000,
        }
    }

    #[tokio::test]
    async fn online_events_skip_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, backlog) = Journal::open(&dir.path().join("j"), 1 << 20).unwrap();
        let (_online, committed, store) = fixture(true);
        let mut sink = DurableSink::new(store, journal, backlog);

        sink.accept(meter_event(1), false).await;
        sink.accept(meter_event(2), false).await;

        assert_eq!(committed.lock().unwrap().len(), 2);
        assert_eq!(sink.queued(), 0);
        assert!(sink.journal.is_empty());
    }

    #[tokio::test]
    async fn offline_events_spill_and_drain_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, backlog) = Journal::open(&dir.path().join("j"), 1 << 20).unwrap();
        let (online, committed, store) = fixture(false);
        let mut sink = DurableSink::new(store, journal, backlog);

        for value in 1..=100u64 {
            sink.accept(meter_event(value), false).await;
        }
        assert_eq!(sink.queued(), 100);
        assert!(committed.lock().unwrap().is_empty());

        online.store(true, Ordering::Relaxed);
        sink.drain().await;

        let committed = committed.lock().unwrap();
        assert_eq!(committed.len(), 100);
        let sequences: Vec<u64> = committed.iter().map(|e| e.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted, "drain broke enqueue order");
        assert_eq!(sink.queued(), 0);
        assert!(sink.journal.is_empty());
    }

    #[tokio::test]
    async fn same_kind_never_jumps_the_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, backlog) = Journal::open(&dir.path().join("j"), 1 << 20).unwrap();
        let (online, committed, store) = fixture(false);
        let mut sink = DurableSink::new(store, journal, backlog);

        sink.accept(meter_event(1), false).await;
        online.store(true, Ordering::Relaxed);
        // Store is back, but a meter event is already journaled: this one
        // must queue behind it.
        sink.accept(meter_event(2), false).await;
        assert!(committed.lock().unwrap().is_empty());
        assert_eq!(sink.queued(), 2);

        sink.drain().await;
        let committed = committed.lock().unwrap();
        let values: Vec<u64> = committed
            .iter()
            .filter_map(|e| match e.decode_event() {
                Some(AgentEvent::MeterChanged { new_value, .. }) => Some(new_value),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn journal_full_rejects_without_crashing() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, backlog) = Journal::open(&dir.path().join("j"), 1_000).unwrap();
        let (_online, _committed, store) = fixture(false);
        let mut sink = DurableSink::new(store, journal, backlog);

        for value in 1..=50u64 {
            sink.accept(meter_event(value), false).await;
        }
        // Some events were accepted, the rest rejected; the sink is still usable.
        assert!(sink.queued() >= 1);
        assert!(sink.queued() < 50);
    }

    #[tokio::test]
    async fn pressure_event_emitted_once_per_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, backlog) = Journal::open(&dir.path().join("j"), 4_000).unwrap();
        let (_online, _committed, store) = fixture(false);
        let mut sink = DurableSink::new(store, journal, backlog);

        for value in 1..=20u64 {
            sink.accept(meter_event(value), false).await;
        }
        let pressure_events = sink
            .queue
            .iter()
            .filter(|e| e.kind == EventKind::EgmEvent)
            .filter(|e| matches!(e.decode_event(), Some(AgentEvent::JournalPressure { .. })))
            .count();
        assert_eq!(pressure_events, 1);
    }
}
