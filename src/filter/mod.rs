//! Cursor smoothing filter bank
//!
//! Reduces device jitter while preserving intentional motion. Six algorithms
//! are available behind the [`SmoothingFilter`] trait; the [`FilterBank`]
//! keeps one filter instance per input channel so that filter state is never
//! shared between producer threads.
//!
//! # Architecture
//!
//! ```text
//! ScaledSample ──► FilterBank ──► SmoothedSample
//!                     │
//!              [per-channel filter]
//! ```
//!
//! Every algorithm is resettable; the first sample after a reset is returned
//! unchanged because there is no history to smooth against.

pub mod adaptive;
pub mod ema;
pub mod gaussian;
pub mod kalman;
pub mod lowpass;
pub mod median;

pub use adaptive::AdaptiveFilter;
pub use ema::EmaFilter;
pub use gaussian::GaussianFilter;
pub use kalman::KalmanFilter;
pub use lowpass::LowPassFilter;
pub use median::MedianFilter;

use crate::pipeline::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Smoothed cursor sample produced by a filter call
///
/// `confidence` is a heuristic certainty in `[0, 1]`, not a probability
/// guarantee. `processing_time` is the wall-clock cost of the call and feeds
/// downstream performance monitoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedSample {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub confidence: f64,
    pub processing_time: Duration,
}

/// Selectable smoothing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmoothingAlgorithm {
    LowPass,
    Ema,
    Kalman,
    Gaussian,
    Median,
    Adaptive,
}

impl fmt::Display for SmoothingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmoothingAlgorithm::LowPass => write!(f, "LowPass"),
            SmoothingAlgorithm::Ema => write!(f, "EMA"),
            SmoothingAlgorithm::Kalman => write!(f, "Kalman"),
            SmoothingAlgorithm::Gaussian => write!(f, "Gaussian"),
            SmoothingAlgorithm::Median => write!(f, "Median"),
            SmoothingAlgorithm::Adaptive => write!(f, "Adaptive"),
        }
    }
}

/// Tuning parameters shared by all smoothing algorithms
///
/// Each algorithm reads only the fields it needs. Values are validated once
/// at pipeline configuration time via [`SmoothingSettings::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingSettings {
    /// Base smoothing factor / low-pass cutoff in `[0, 1]`
    pub smoothing_factor: f64,

    /// Separate smoothing factor for the velocity estimate (EMA)
    pub velocity_alpha: f64,

    /// Lower bound for the adaptive smoothing factor
    pub min_smoothing: f64,

    /// Upper bound for the adaptive smoothing factor
    pub max_smoothing: f64,

    /// Velocity magnitude at which adaptive smoothing reaches `min_smoothing`
    pub velocity_threshold: f64,

    /// Standard deviation of the Gaussian kernel
    pub gaussian_sigma: f64,

    /// Gaussian history window size in samples
    pub gaussian_window: usize,

    /// Median history window size in samples
    pub median_window: usize,

    /// Kalman process noise Q
    pub kalman_process_noise: f64,

    /// Kalman measurement noise R
    pub kalman_measurement_noise: f64,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            smoothing_factor: 0.5,
            velocity_alpha: 0.3,
            min_smoothing: 0.1,
            max_smoothing: 0.8,
            velocity_threshold: 500.0,
            gaussian_sigma: 1.0,
            gaussian_window: 5,
            median_window: 5,
            kalman_process_noise: 0.01,
            kalman_measurement_noise: 0.1,
        }
    }
}

impl SmoothingSettings {
    /// Validates all parameters, leaving state unchanged on failure
    pub fn validate(&self) -> Result<(), FilterError> {
        if !(0.0..=1.0).contains(&self.smoothing_factor) {
            return Err(FilterError::InvalidSetting(format!(
                "smoothing_factor {} outside [0, 1]",
                self.smoothing_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.velocity_alpha) {
            return Err(FilterError::InvalidSetting(format!(
                "velocity_alpha {} outside [0, 1]",
                self.velocity_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.min_smoothing)
            || !(0.0..=1.0).contains(&self.max_smoothing)
            || self.min_smoothing > self.max_smoothing
        {
            return Err(FilterError::InvalidSetting(format!(
                "adaptive smoothing bounds [{}, {}] invalid",
                self.min_smoothing, self.max_smoothing
            )));
        }
        if self.velocity_threshold <= 0.0 {
            return Err(FilterError::InvalidSetting(format!(
                "velocity_threshold {} must be positive",
                self.velocity_threshold
            )));
        }
        if self.gaussian_sigma <= 0.0 {
            return Err(FilterError::InvalidSetting(format!(
                "gaussian_sigma {} must be positive",
                self.gaussian_sigma
            )));
        }
        if self.gaussian_window < 2 || self.median_window < 2 {
            return Err(FilterError::InvalidSetting(
                "history windows must hold at least 2 samples".to_string(),
            ));
        }
        if self.kalman_process_noise <= 0.0 || self.kalman_measurement_noise <= 0.0 {
            return Err(FilterError::InvalidSetting(
                "kalman noise parameters must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Filter errors
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid filter setting: {0}")]
    InvalidSetting(String),
}

/// Common interface for all smoothing algorithms
///
/// Implementations keep their own history and must never be shared across
/// threads; the [`FilterBank`] enforces one instance per channel.
pub trait SmoothingFilter: Send + 'static {
    /// Smooths one position sample, returning the filtered estimate
    ///
    /// The first call after construction or [`reset`](SmoothingFilter::reset)
    /// returns the input position unchanged.
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample;

    /// Clears all history, returning the filter to its uninitialized state
    fn reset(&mut self);

    /// Algorithm implemented by this filter
    fn algorithm(&self) -> SmoothingAlgorithm;
}

/// Creates a boxed filter for the given algorithm
pub fn create_filter(
    algorithm: SmoothingAlgorithm,
    settings: &SmoothingSettings,
) -> Box<dyn SmoothingFilter> {
    match algorithm {
        SmoothingAlgorithm::LowPass => Box::new(LowPassFilter::new(settings)),
        SmoothingAlgorithm::Ema => Box::new(EmaFilter::new(settings)),
        SmoothingAlgorithm::Kalman => Box::new(KalmanFilter::new(settings)),
        SmoothingAlgorithm::Gaussian => Box::new(GaussianFilter::new(settings)),
        SmoothingAlgorithm::Median => Box::new(MedianFilter::new(settings)),
        SmoothingAlgorithm::Adaptive => Box::new(AdaptiveFilter::new(settings)),
    }
}

/// Per-channel filter bank
///
/// Lazily creates one filter instance per device channel. Owned by exactly
/// one producer, so no locking is needed around filter state.
pub struct FilterBank {
    algorithm: SmoothingAlgorithm,
    settings: SmoothingSettings,
    channels: HashMap<DeviceId, Box<dyn SmoothingFilter>>,
}

impl FilterBank {
    pub fn new(algorithm: SmoothingAlgorithm, settings: SmoothingSettings) -> Self {
        info!("Creating filter bank with {} smoothing", algorithm);
        Self {
            algorithm,
            settings,
            channels: HashMap::new(),
        }
    }

    /// Smooths a sample on the given channel, creating the filter on demand
    pub fn smooth(&mut self, channel: DeviceId, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let algorithm = self.algorithm;
        let settings = &self.settings;
        let filter = self
            .channels
            .entry(channel)
            .or_insert_with(|| create_filter(algorithm, settings));
        filter.smooth(x, y, timestamp_ns)
    }

    /// Currently selected algorithm
    pub fn algorithm(&self) -> SmoothingAlgorithm {
        self.algorithm
    }

    /// Switches algorithm, discarding all per-channel history
    pub fn set_algorithm(&mut self, algorithm: SmoothingAlgorithm) {
        if algorithm != self.algorithm {
            info!("Switching smoothing algorithm: {} -> {}", self.algorithm, algorithm);
            self.algorithm = algorithm;
            self.channels.clear();
        }
    }

    /// Replaces tuning parameters after validation, rebuilding all channels
    pub fn set_settings(&mut self, settings: SmoothingSettings) -> Result<(), FilterError> {
        settings.validate()?;
        debug!("Updating smoothing settings: {:?}", settings);
        self.settings = settings;
        self.channels.clear();
        Ok(())
    }

    /// Resets every channel filter to its uninitialized state
    pub fn reset_all(&mut self) {
        debug!("Resetting {} filter channels", self.channels.len());
        for filter in self.channels.values_mut() {
            filter.reset();
        }
    }
}

/// Seconds between two nanosecond timestamps, floored at a tenth of a
/// millisecond so stalled timestamps cannot blow up velocity estimates
pub(crate) fn delta_seconds(prev_ns: u64, now_ns: u64) -> f64 {
    const MIN_DT: f64 = 1e-4;
    let dt = now_ns.saturating_sub(prev_ns) as f64 / 1e9;
    if dt < MIN_DT {
        MIN_DT
    } else {
        dt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DeviceId;

    const ALL_ALGORITHMS: [SmoothingAlgorithm; 6] = [
        SmoothingAlgorithm::LowPass,
        SmoothingAlgorithm::Ema,
        SmoothingAlgorithm::Kalman,
        SmoothingAlgorithm::Gaussian,
        SmoothingAlgorithm::Median,
        SmoothingAlgorithm::Adaptive,
    ];

    #[test]
    fn first_sample_passes_through_unchanged() {
        let settings = SmoothingSettings::default();
        for algorithm in ALL_ALGORITHMS {
            let mut filter = create_filter(algorithm, &settings);
            let out = filter.smooth(12.5, -3.25, 1_000_000);
            assert_eq!(out.x, 12.5, "{algorithm} changed first x");
            assert_eq!(out.y, -3.25, "{algorithm} changed first y");
        }
    }

    #[test]
    fn first_sample_after_reset_passes_through() {
        let settings = SmoothingSettings::default();
        for algorithm in ALL_ALGORITHMS {
            let mut filter = create_filter(algorithm, &settings);
            for i in 0..10 {
                filter.smooth(i as f64, i as f64 * 2.0, 1_000_000 * (i + 1));
            }
            filter.reset();
            let out = filter.smooth(99.0, -99.0, 1_000_000_000);
            assert_eq!(out.x, 99.0, "{algorithm} kept history across reset");
            assert_eq!(out.y, -99.0, "{algorithm} kept history across reset");
        }
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let settings = SmoothingSettings::default();
        for algorithm in ALL_ALGORITHMS {
            let mut filter = create_filter(algorithm, &settings);
            for i in 0..50u64 {
                let out = filter.smooth((i as f64).sin() * 10.0, i as f64, 1_000_000 * (i + 1));
                assert!(
                    (0.0..=1.0).contains(&out.confidence),
                    "{algorithm} confidence {} outside [0, 1]",
                    out.confidence
                );
            }
        }
    }

    #[test]
    fn bank_keeps_channels_independent() {
        let mut bank = FilterBank::new(SmoothingAlgorithm::Ema, SmoothingSettings::default());
        let a = DeviceId(1);
        let b = DeviceId(2);

        bank.smooth(a, 0.0, 0.0, 1_000);
        bank.smooth(a, 100.0, 100.0, 2_000_000);

        // First sample on a fresh channel is identity regardless of channel a history.
        let out = bank.smooth(b, 7.0, 7.0, 3_000_000);
        assert_eq!(out.x, 7.0);
        assert_eq!(out.y, 7.0);
    }

    #[test]
    fn switching_algorithm_clears_history() {
        let mut bank = FilterBank::new(SmoothingAlgorithm::Ema, SmoothingSettings::default());
        let ch = DeviceId(1);
        bank.smooth(ch, 0.0, 0.0, 1_000);
        bank.smooth(ch, 10.0, 10.0, 2_000_000);

        bank.set_algorithm(SmoothingAlgorithm::Median);
        let out = bank.smooth(ch, 42.0, 42.0, 3_000_000);
        assert_eq!(out.x, 42.0);
    }

    #[test]
    fn settings_validation_rejects_bad_ranges() {
        let mut settings = SmoothingSettings::default();
        settings.smoothing_factor = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = SmoothingSettings::default();
        settings.min_smoothing = 0.9;
        settings.max_smoothing = 0.2;
        assert!(settings.validate().is_err());

        let mut settings = SmoothingSettings::default();
        settings.velocity_threshold = 0.0;
        assert!(settings.validate().is_err());

        assert!(SmoothingSettings::default().validate().is_ok());
    }
}
