//! Bounded priority event queue with explicit loss accounting
//!
//! Events are ordered by (priority, timestamp): CRITICAL before HIGH before
//! NORMAL before LOW, FIFO by timestamp inside a class. Overflow is never
//! silent; every eviction and rejection increments an observable counter.
//!
//! # Architecture
//!
//! ```text
//! enqueue ──► [binary heap + stats, one mutex] ──► dequeue_batch
//!                        │
//!                 QueueStats snapshot
//! ```

pub mod event_queue;

pub use event_queue::EventQueue;

use crate::pipeline::{DeviceId, PipelineEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Event priority; lower ordinal dequeues first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "CRITICAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Queue draining strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueMode {
    /// Drain as fast as possible, bounded events per cycle
    Realtime,
    /// Fixed-size batches
    Batch,
    /// Switch between Realtime and Batch on occupancy thresholds
    Adaptive,
    /// Time-boxed draining per cycle
    Throttled,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Realtime => write!(f, "REALTIME"),
            QueueMode::Batch => write!(f, "BATCH"),
            QueueMode::Adaptive => write!(f, "ADAPTIVE"),
            QueueMode::Throttled => write!(f, "THROTTLED"),
        }
    }
}

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Event wrapper that lives from enqueue to consumption
///
/// Priority is immutable after enqueue; `retry_count` tracks dispatch
/// attempts and is bounded by the pipeline's `max_retries`.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event_id: String,
    pub event: PipelineEvent,
    pub priority: Priority,
    pub timestamp_ns: u64,
    pub source: DeviceId,
    pub retry_count: u32,
}

impl QueuedEvent {
    pub fn new(event: PipelineEvent, priority: Priority) -> Self {
        let id = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            event_id: format!("evt-{id:016x}"),
            timestamp_ns: event.timestamp_ns(),
            source: event.source(),
            event,
            priority,
            retry_count: 0,
        }
    }
}

/// Snapshot of running queue statistics
///
/// Always queryable; invisible data loss is not a possible outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub handler_errors: u64,
    /// Raw samples discarded before enqueue for violating per-source
    /// timestamp ordering
    pub out_of_order_discards: u64,
    pub current_size: usize,
    pub max_size_observed: usize,
    pub events_per_sec: f64,
    pub avg_processing_time_us: f64,
    pub max_processing_time_us: u64,
    /// Set when drops plus handler errors exceeded the configured ceiling
    /// within the monitoring window; the caller decides whether to halt.
    pub degraded: bool,
}
