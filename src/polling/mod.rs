//! Adaptive polling-rate control
//!
//! Drives periodic sampling per device class (mouse, keyboard) at a
//! controllable rate between 125 and 8000 Hz and adapts that rate to
//! measured load.
//!
//! # Architecture
//!
//! ```text
//! set_rate / set_mode ──► watch ──► [polling loop task] ──► PollHandler::poll
//!                                        │
//!                                  PollingState snapshots
//! ```

pub mod controller;

pub use controller::{PollHandler, PollingController, PollingLoopHandle, PollingSettings};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest accepted polling rate in Hz
pub const MIN_RATE: u32 = 125;
/// Highest accepted polling rate in Hz
pub const MAX_RATE: u32 = 8000;
/// Rate ceiling enforced by POWER_SAVE mode
pub const POWER_SAVE_CEILING: u32 = 1000;

/// Device class driven by one polling loop each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Mouse,
    Keyboard,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Mouse => write!(f, "mouse"),
            DeviceClass::Keyboard => write!(f, "keyboard"),
        }
    }
}

/// Polling rate control strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollingMode {
    /// Rate stays where it was set
    Fixed,
    /// Feedback loop adjusts the rate against measured load
    Adaptive,
    /// Rate clamped to the maximum
    Gaming,
    /// Rate clamped under a low ceiling
    PowerSave,
}

impl fmt::Display for PollingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollingMode::Fixed => write!(f, "FIXED"),
            PollingMode::Adaptive => write!(f, "ADAPTIVE"),
            PollingMode::Gaming => write!(f, "GAMING"),
            PollingMode::PowerSave => write!(f, "POWER_SAVE"),
        }
    }
}

/// Snapshot of one polling loop's state
///
/// Mutated only by the loop's own feedback cycle; everyone else reads
/// snapshots through a watch channel.
#[derive(Debug, Clone)]
pub struct PollingState {
    pub device_class: DeviceClass,
    pub target_rate: u32,
    pub actual_rate: u32,
    pub mode: PollingMode,
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
    pub poll_errors: u64,
}

impl PollingState {
    pub fn new(device_class: DeviceClass, target_rate: u32, mode: PollingMode) -> Self {
        Self {
            device_class,
            target_rate,
            actual_rate: 0,
            mode,
            avg_latency_us: 0.0,
            max_latency_us: 0,
            poll_errors: 0,
        }
    }
}

/// Polling errors
#[derive(Debug, thiserror::Error)]
pub enum PollingError {
    #[error("Polling rate {rate}Hz outside valid range [{MIN_RATE}, {MAX_RATE}]")]
    InvalidRate { rate: u32 },

    #[error("No polling loop registered for {0} device class")]
    UnknownDeviceClass(DeviceClass),

    #[error("Sample channel for {0} closed")]
    ChannelClosed(DeviceClass),

    #[error("Polling loop for {0} failed to stop within the join timeout")]
    JoinTimeout(DeviceClass),

    #[error("Polling loop for {0} panicked: {1}")]
    LoopPanicked(DeviceClass, String),
}
