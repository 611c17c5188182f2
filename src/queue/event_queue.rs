//! Thread-safe bounded priority queue implementation
//!
//! A binary heap and its statistics live behind a single mutex held only for
//! the duration of heap mutation, never while consumer handlers run.

use crate::queue::{Priority, QueueMode, QueueStats, QueuedEvent};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct HeapEntry {
    event: QueuedEvent,
    /// Insertion sequence; stabilizes FIFO order for identical timestamps
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: best priority (lowest ordinal), then earliest timestamp.
        other
            .event
            .priority
            .cmp(&self.event.priority)
            .then(other.event.timestamp_ns.cmp(&self.event.timestamp_ns))
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    mode: QueueMode,
    next_seq: u64,

    total_enqueued: u64,
    total_processed: u64,
    total_dropped: u64,
    handler_errors: u64,
    out_of_order_discards: u64,
    max_size_observed: usize,

    rate_window_start: Instant,
    rate_window_count: u64,
    events_per_sec: f64,

    sum_processing_us: u128,
    max_processing_us: u64,

    degraded_window_start: Instant,
    degraded_window_losses: u64,
    degraded: bool,
}

/// Bounded, priority-ordered, thread-safe event buffer
pub struct EventQueue {
    inner: Mutex<Inner>,
    max_size: usize,
    degraded_ceiling: u64,
    degraded_window: Duration,
}

impl EventQueue {
    /// Creates a queue holding at most `max_size` events
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is zero; a queue that can hold nothing is a
    /// programming-contract violation, not a runtime condition.
    pub fn new(max_size: usize, mode: QueueMode) -> Self {
        assert!(max_size > 0, "queue capacity must be positive");
        info!("Creating event queue: capacity {}, mode {}", max_size, mode);
        let now = Instant::now();
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(max_size),
                mode,
                next_seq: 0,
                total_enqueued: 0,
                total_processed: 0,
                total_dropped: 0,
                handler_errors: 0,
                out_of_order_discards: 0,
                max_size_observed: 0,
                rate_window_start: now,
                rate_window_count: 0,
                events_per_sec: 0.0,
                sum_processing_us: 0,
                max_processing_us: 0,
                degraded_window_start: now,
                degraded_window_losses: 0,
                degraded: false,
            }),
            max_size,
            degraded_ceiling: u64::MAX,
            degraded_window: Duration::from_secs(1),
        }
    }

    /// Sets the loss ceiling per monitoring window that flips the queue into
    /// a reported degraded state
    pub fn with_degraded_ceiling(mut self, ceiling: u64, window: Duration) -> Self {
        self.degraded_ceiling = ceiling;
        self.degraded_window = window;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-mutation of
        // counters; the heap itself is updated atomically per operation.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inserts an event by (priority, timestamp) order
    ///
    /// At capacity, events with strictly worse priority than the incoming
    /// one are evicted (earliest timestamp first within the worst class) and
    /// counted as drops. If nothing is evictable the event is rejected, the
    /// drop counter is incremented, and `false` is returned.
    pub fn enqueue(&self, event: QueuedEvent) -> bool {
        let mut inner = self.lock();

        while inner.heap.len() >= self.max_size {
            match find_eviction_candidate(&inner.heap, event.priority) {
                Some(victim_seq) => {
                    let mut entries = std::mem::take(&mut inner.heap).into_vec();
                    if let Some(pos) = entries.iter().position(|e| e.seq == victim_seq) {
                        let victim = entries.swap_remove(pos);
                        debug!(
                            "Evicted {} ({}) for incoming {} event",
                            victim.event.event_id, victim.event.priority, event.priority
                        );
                    }
                    inner.heap = BinaryHeap::from(entries);
                    inner.total_dropped += 1;
                    inner.degraded_window_losses += 1;
                }
                None => {
                    inner.total_dropped += 1;
                    inner.degraded_window_losses += 1;
                    update_degraded(&mut inner, self.degraded_ceiling, self.degraded_window);
                    warn!(
                        "Queue full with no evictable events, rejecting {} ({})",
                        event.event_id, event.priority
                    );
                    return false;
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapEntry { event, seq });

        inner.total_enqueued += 1;
        inner.rate_window_count += 1;
        let size = inner.heap.len();
        if size > inner.max_size_observed {
            inner.max_size_observed = size;
        }

        let window = inner.rate_window_start.elapsed();
        if window >= Duration::from_secs(1) {
            inner.events_per_sec = inner.rate_window_count as f64 / window.as_secs_f64();
            inner.rate_window_count = 0;
            inner.rate_window_start = Instant::now();
        }
        update_degraded(&mut inner, self.degraded_ceiling, self.degraded_window);
        true
    }

    /// Pops up to `n` highest-priority events, ties broken by earliest
    /// timestamp
    pub fn dequeue_batch(&self, n: usize) -> Vec<QueuedEvent> {
        let mut inner = self.lock();
        let mut batch = Vec::with_capacity(n.min(inner.heap.len()));
        for _ in 0..n {
            match inner.heap.pop() {
                Some(entry) => batch.push(entry.event),
                None => break,
            }
        }
        batch
    }

    /// Records successful consumption of one event and its handler cost
    pub fn record_processed(&self, processing_time: Duration) {
        let mut inner = self.lock();
        inner.total_processed += 1;
        let micros = processing_time.as_micros();
        inner.sum_processing_us += micros;
        let micros = micros.min(u64::MAX as u128) as u64;
        if micros > inner.max_processing_us {
            inner.max_processing_us = micros;
        }
    }

    /// Records a handler failure during dispatch
    pub fn record_handler_error(&self) {
        let mut inner = self.lock();
        inner.handler_errors += 1;
        inner.degraded_window_losses += 1;
        update_degraded(&mut inner, self.degraded_ceiling, self.degraded_window);
    }

    /// Records a raw sample discarded before enqueue because its timestamp
    /// was not strictly increasing for its source
    ///
    /// These never entered the queue, so they are tracked separately from
    /// drops and do not feed the degraded-state window.
    pub fn record_out_of_order(&self) {
        self.lock().out_of_order_discards += 1;
    }

    /// Records an event discarded after exhausting its retries
    pub fn record_discarded(&self) {
        let mut inner = self.lock();
        inner.total_dropped += 1;
        inner.degraded_window_losses += 1;
        update_degraded(&mut inner, self.degraded_ceiling, self.degraded_window);
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Fill level in `[0, 1]`
    pub fn occupancy(&self) -> f64 {
        self.lock().heap.len() as f64 / self.max_size as f64
    }

    pub fn mode(&self) -> QueueMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: QueueMode) {
        let mut inner = self.lock();
        if inner.mode != mode {
            info!("Queue mode: {} -> {}", inner.mode, mode);
            inner.mode = mode;
        }
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            total_enqueued: inner.total_enqueued,
            total_processed: inner.total_processed,
            total_dropped: inner.total_dropped,
            handler_errors: inner.handler_errors,
            out_of_order_discards: inner.out_of_order_discards,
            current_size: inner.heap.len(),
            max_size_observed: inner.max_size_observed,
            events_per_sec: inner.events_per_sec,
            avg_processing_time_us: if inner.total_processed == 0 {
                0.0
            } else {
                inner.sum_processing_us as f64 / inner.total_processed as f64
            },
            max_processing_time_us: inner.max_processing_us,
            degraded: inner.degraded,
        }
    }
}

/// Picks the eviction victim for an incoming event of `incoming` priority:
/// the worst-priority entry strictly below it, earliest timestamp first
fn find_eviction_candidate(heap: &BinaryHeap<HeapEntry>, incoming: Priority) -> Option<u64> {
    heap.iter()
        .filter(|entry| entry.event.priority > incoming)
        .max_by(|a, b| {
            a.event
                .priority
                .cmp(&b.event.priority)
                .then(b.event.timestamp_ns.cmp(&a.event.timestamp_ns))
                .then(b.seq.cmp(&a.seq))
        })
        .map(|entry| entry.seq)
}

fn update_degraded(inner: &mut Inner, ceiling: u64, window: Duration) {
    if inner.degraded_window_start.elapsed() >= window {
        inner.degraded = inner.degraded_window_losses > ceiling;
        inner.degraded_window_losses = 0;
        inner.degraded_window_start = Instant::now();
    } else if inner.degraded_window_losses > ceiling {
        inner.degraded = true;
    }
}
