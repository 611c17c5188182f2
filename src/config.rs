//! Runtime configuration surface for the pipeline
//!
//! Everything here is runtime-settable; no file format is owned by this
//! crate. The serde derives exist so external profile storage can serialize
//! a configuration, nothing more.
//!
//! A single parameterized [`DrainTuning`] replaces separate "optimized" /
//! "power-saving" pipeline variants; named [`PipelinePreset`]s select a
//! tuning instead of duplicating code paths.

use crate::filter::{FilterError, SmoothingAlgorithm, SmoothingSettings};
use crate::polling::{PollingMode, MAX_RATE, MIN_RATE};
use crate::queue::QueueMode;
use crate::scaler::{ScalerMode, MAX_DPI, MIN_DPI};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("target_dpi {0} outside [{MIN_DPI}, {MAX_DPI}]")]
    InvalidTargetDpi(u32),

    #[error("base_dpi must be positive")]
    InvalidBaseDpi,

    #[error("{device} polling rate {rate}Hz outside [{MIN_RATE}, {MAX_RATE}]")]
    InvalidPollingRate { device: &'static str, rate: u32 },

    #[error("queue_max_size must be positive")]
    InvalidQueueSize,

    #[error("adaptive_threshold {0} must be positive")]
    InvalidAdaptiveThreshold(f64),

    #[error("drain tuning invalid: {0}")]
    InvalidDrainTuning(String),

    #[error(transparent)]
    InvalidSmoothing(#[from] FilterError),
}

/// Tuning knobs for the queue drain loop
///
/// One struct drives all four queue modes; presets only vary the numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainTuning {
    /// Events drained per cycle in REALTIME mode (bounds starvation)
    pub drain_budget: usize,
    /// Batch size in BATCH mode
    pub batch_size: usize,
    /// Smaller batch used by ADAPTIVE mode above the high watermark
    pub reduced_batch_size: usize,
    /// Occupancy above which ADAPTIVE falls back to batching
    pub high_watermark: f64,
    /// Occupancy below which ADAPTIVE drains in realtime
    pub low_watermark: f64,
    /// Wall-clock budget per cycle in THROTTLED mode, microseconds
    pub throttle_budget_us: u64,
    /// Sleep between cycles when the queue was empty, microseconds
    pub idle_sleep_us: u64,
    /// Sleep floor between cycles when events were drained, microseconds
    pub busy_sleep_us: u64,
}

impl Default for DrainTuning {
    fn default() -> Self {
        Self {
            drain_budget: 256,
            batch_size: 64,
            reduced_batch_size: 16,
            high_watermark: 0.8,
            low_watermark: 0.5,
            throttle_budget_us: 500,
            idle_sleep_us: 500,
            busy_sleep_us: 50,
        }
    }
}

impl DrainTuning {
    pub fn throttle_budget(&self) -> Duration {
        Duration::from_micros(self.throttle_budget_us)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    pub fn busy_sleep(&self) -> Duration {
        Duration::from_micros(self.busy_sleep_us)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_budget == 0 || self.batch_size == 0 || self.reduced_batch_size == 0 {
            return Err(ConfigError::InvalidDrainTuning(
                "batch sizes and drain budget must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.high_watermark)
            || !(0.0..=1.0).contains(&self.low_watermark)
            || self.low_watermark > self.high_watermark
        {
            return Err(ConfigError::InvalidDrainTuning(format!(
                "watermarks [{}, {}] must be ordered fractions of capacity",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Device hardware DPI
    pub base_dpi: u32,
    /// Virtual DPI, `[400, 26000]`
    pub target_dpi: u32,
    pub scaler_mode: ScalerMode,
    /// 3-sample weighted pre-smoothing before scaling
    pub pre_smoothing: bool,

    pub mouse_polling_rate: u32,
    pub keyboard_polling_rate: u32,
    pub polling_mode: PollingMode,
    /// Smoothed-load value the adaptive feedback loop compares against
    pub adaptive_threshold: f64,

    pub smoothing_algorithm: SmoothingAlgorithm,
    pub smoothing: SmoothingSettings,

    pub queue_max_size: usize,
    pub queue_mode: QueueMode,
    pub drain: DrainTuning,

    /// Dispatch attempts per event before it is discarded and counted
    pub max_retries: u32,
    /// Drops plus handler errors per monitoring window that flip the
    /// pipeline into a reported degraded state
    pub degraded_ceiling: u64,
    pub degraded_window_ms: u64,

    /// Raw sample channel capacity per device class
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_dpi: 800,
            target_dpi: 800,
            scaler_mode: ScalerMode::Software,
            pre_smoothing: false,
            mouse_polling_rate: 1000,
            keyboard_polling_rate: 1000,
            polling_mode: PollingMode::Fixed,
            adaptive_threshold: 0.75,
            smoothing_algorithm: SmoothingAlgorithm::Ema,
            smoothing: SmoothingSettings::default(),
            queue_max_size: 4096,
            queue_mode: QueueMode::Adaptive,
            drain: DrainTuning::default(),
            max_retries: 3,
            degraded_ceiling: 1000,
            degraded_window_ms: 1000,
            channel_capacity: 2048,
        }
    }
}

impl PipelineConfig {
    /// Validates every field; rejected values leave no partial state behind
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_dpi == 0 {
            return Err(ConfigError::InvalidBaseDpi);
        }
        if !(MIN_DPI..=MAX_DPI).contains(&self.target_dpi) {
            return Err(ConfigError::InvalidTargetDpi(self.target_dpi));
        }
        if !(MIN_RATE..=MAX_RATE).contains(&self.mouse_polling_rate) {
            return Err(ConfigError::InvalidPollingRate {
                device: "mouse",
                rate: self.mouse_polling_rate,
            });
        }
        if !(MIN_RATE..=MAX_RATE).contains(&self.keyboard_polling_rate) {
            return Err(ConfigError::InvalidPollingRate {
                device: "keyboard",
                rate: self.keyboard_polling_rate,
            });
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        if self.adaptive_threshold <= 0.0 {
            return Err(ConfigError::InvalidAdaptiveThreshold(self.adaptive_threshold));
        }
        self.drain.validate()?;
        self.smoothing.validate()?;
        Ok(())
    }

    pub fn degraded_window(&self) -> Duration {
        Duration::from_millis(self.degraded_window_ms)
    }
}

/// Named configuration presets
///
/// Each preset is an ordinary [`PipelineConfig`]; callers tweak individual
/// fields afterwards if they need to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelinePreset {
    /// Minimum added latency: maximum rates, realtime draining, tight sleeps
    Latency,
    /// Adaptive rates and draining for mixed workloads
    Balanced,
    /// Low CPU budget: capped rates, batched draining, generous sleeps
    PowerSave,
}

impl PipelinePreset {
    pub fn config(self) -> PipelineConfig {
        let base = PipelineConfig::default();
        match self {
            PipelinePreset::Latency => PipelineConfig {
                mouse_polling_rate: MAX_RATE,
                keyboard_polling_rate: MAX_RATE,
                polling_mode: PollingMode::Gaming,
                queue_mode: QueueMode::Realtime,
                drain: DrainTuning {
                    drain_budget: 512,
                    idle_sleep_us: 100,
                    busy_sleep_us: 10,
                    ..DrainTuning::default()
                },
                ..base
            },
            PipelinePreset::Balanced => PipelineConfig {
                polling_mode: PollingMode::Adaptive,
                queue_mode: QueueMode::Adaptive,
                ..base
            },
            PipelinePreset::PowerSave => PipelineConfig {
                mouse_polling_rate: 500,
                keyboard_polling_rate: 250,
                polling_mode: PollingMode::PowerSave,
                queue_mode: QueueMode::Throttled,
                drain: DrainTuning {
                    batch_size: 128,
                    throttle_budget_us: 250,
                    idle_sleep_us: 2000,
                    busy_sleep_us: 500,
                    ..DrainTuning::default()
                },
                ..base
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn every_preset_is_valid() {
        for preset in [
            PipelinePreset::Latency,
            PipelinePreset::Balanced,
            PipelinePreset::PowerSave,
        ] {
            assert!(preset.config().validate().is_ok(), "{preset:?} invalid");
        }
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let mut config = PipelineConfig::default();
        config.target_dpi = 300;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTargetDpi(300))
        ));

        let mut config = PipelineConfig::default();
        config.mouse_polling_rate = 10_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPollingRate { device: "mouse", .. })
        ));

        let mut config = PipelineConfig::default();
        config.queue_max_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueueSize)));
    }

    #[test]
    fn watermarks_must_be_ordered() {
        let mut config = PipelineConfig::default();
        config.drain.low_watermark = 0.9;
        config.drain.high_watermark = 0.4;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDrainTuning(_))
        ));
    }

    #[test]
    fn presets_differ_where_it_matters() {
        let latency = PipelinePreset::Latency.config();
        let power = PipelinePreset::PowerSave.config();
        assert_eq!(latency.mouse_polling_rate, MAX_RATE);
        assert!(power.mouse_polling_rate < latency.mouse_polling_rate);
        assert!(power.drain.idle_sleep_us > latency.drain.idle_sleep_us);
    }
}
