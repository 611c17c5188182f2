//! Pipeline coordinator and event dispatch
//!
//! Wires the processing chain together and delivers events to registered
//! consumers:
//!
//! ```text
//! RawSample ──► DpiScaler ──► FilterBank ──► EventQueue ──► handlers
//!                  ▲                             ▲
//!          [mouse polling loop]          [drain loop task]
//! ```
//!
//! Event types form a closed tagged enum; handlers register per variant or
//! for whole batches, checked at compile time rather than through
//! string-keyed callback maps.

pub mod coordinator;
pub mod dispatcher;
pub mod worker;

pub use coordinator::{PipelineCoordinator, PipelineHandle};
pub use dispatcher::{ErrorContext, EventDispatcher};

use crate::filter::FilterError;
use crate::polling::PollingError;
use crate::scaler::ScalerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one input channel (a physical or virtual device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Raw pointer sample as delivered by the OS-level listener collaborator
///
/// Timestamps are monotonic nanoseconds and strictly increasing per source;
/// samples violating that invariant are discarded with a counter bump.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub dx: i32,
    pub dy: i32,
    /// Button bitset, one bit per button
    pub buttons: u32,
    pub timestamp_ns: u64,
    pub source: DeviceId,
}

/// Raw keyboard sample from the listener collaborator
#[derive(Debug, Clone, Copy)]
pub struct KeySample {
    pub key_id: u16,
    pub pressed: bool,
    pub timestamp_ns: u64,
    pub source: DeviceId,
}

/// Closed set of events the pipeline can deliver
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Scaled and smoothed cursor motion
    PointerMotion {
        source: DeviceId,
        /// Smoothed absolute cursor position
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
        /// Scaled delta that produced this position update
        dx: f64,
        dy: f64,
        /// Filter certainty in `[0, 1]`
        confidence: f64,
        timestamp_ns: u64,
    },
    /// Button bitset transition on a pointer device
    ButtonChange {
        source: DeviceId,
        buttons: u32,
        pressed_mask: u32,
        released_mask: u32,
        timestamp_ns: u64,
    },
    /// Key press or release
    KeyInput {
        source: DeviceId,
        key_id: u16,
        pressed: bool,
        timestamp_ns: u64,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::PointerMotion { .. } => EventKind::PointerMotion,
            PipelineEvent::ButtonChange { .. } => EventKind::ButtonChange,
            PipelineEvent::KeyInput { .. } => EventKind::KeyInput,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            PipelineEvent::PointerMotion { timestamp_ns, .. }
            | PipelineEvent::ButtonChange { timestamp_ns, .. }
            | PipelineEvent::KeyInput { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    pub fn source(&self) -> DeviceId {
        match self {
            PipelineEvent::PointerMotion { source, .. }
            | PipelineEvent::ButtonChange { source, .. }
            | PipelineEvent::KeyInput { source, .. } => *source,
        }
    }
}

/// Discriminant used for per-type handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PointerMotion,
    ButtonChange,
    KeyInput,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::PointerMotion => write!(f, "PointerMotion"),
            EventKind::ButtonChange => write!(f, "ButtonChange"),
            EventKind::KeyInput => write!(f, "KeyInput"),
        }
    }
}

/// Pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Scaler error: {0}")]
    ScalerError(#[from] ScalerError),

    #[error("Filter error: {0}")]
    FilterError(#[from] FilterError),

    #[error("Polling error: {0}")]
    PollingError(#[from] PollingError),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Handler failed for event {event_id}: {message}")]
    HandlerError { event_id: String, message: String },

    #[error("Lifecycle error: {0}")]
    LifecycleError(String),
}
