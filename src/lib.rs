//! Input optimization pipeline for gaming peripherals
//!
//! Takes raw pointer and keyboard samples, scales pointer deltas to a
//! virtual DPI, smooths cursor motion, and delivers the results to
//! registered consumers through a bounded priority queue with adaptive
//! polling on the producer side.
//!
//! # Architecture
//!
//! ```text
//! RawSample ──► DpiScaler ──► FilterBank ──► EventQueue ──► handlers
//!                  ▲                             ▲
//!          [polling loops]                 [drain loop]
//!                  ▲                             ▲
//!                  └──────── PipelineHandle ─────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use openinput::config::PipelinePreset;
//! use openinput::pipeline::{EventKind, PipelineHandle};
//!
//! # async fn run() -> Result<(), openinput::pipeline::PipelineError> {
//! let mut pipeline = PipelineHandle::spawn(PipelinePreset::Balanced.config())?;
//! pipeline.on(EventKind::PointerMotion, |event| {
//!     println!("cursor update: {event:?}");
//! });
//! pipeline.set_dpi(1600)?;
//! // ... feed samples through pipeline.pointer_sender() ...
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod filter;
pub mod pipeline;
pub mod polling;
pub mod queue;
pub mod scaler;

pub use config::{DrainTuning, PipelineConfig, PipelinePreset};
pub use filter::{FilterBank, SmoothingAlgorithm, SmoothingSettings};
pub use pipeline::{
    DeviceId, EventKind, PipelineError, PipelineEvent, PipelineHandle, RawSample,
};
pub use polling::{DeviceClass, PollingMode, PollingState};
pub use queue::{EventQueue, Priority, QueueMode, QueueStats};
pub use scaler::{DpiScaler, ScalerMode};
