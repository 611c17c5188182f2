//! Software DPI scaling for raw pointer deltas
//!
//! Converts device deltas into deltas for a user-chosen virtual DPI:
//! `dx' = dx · target_dpi / base_dpi`. An optional pre-smoothing pass blends
//! the last three raw samples with fixed most-recent-weighted coefficients
//! before scaling.
//!
//! The HYBRID mode additionally asks an external [`PointerSpeedAdjuster`]
//! collaborator for an OS-level pointer-speed change; that side effect lives
//! outside this core.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lowest accepted virtual DPI
pub const MIN_DPI: u32 = 400;
/// Highest accepted virtual DPI
pub const MAX_DPI: u32 = 26_000;

/// Pre-smoothing weights for the last three raw samples, oldest first
const PRE_SMOOTH_WEIGHTS: [f64; 3] = [0.1, 0.3, 0.6];

/// Scaling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalerMode {
    /// Pure numeric transform (default)
    Software,
    /// Numeric transform plus an OS pointer-speed adjustment via collaborator
    Hybrid,
    /// Passthrough; the scaling factor is forced to 1.0
    Native,
}

impl fmt::Display for ScalerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalerMode::Software => write!(f, "Software"),
            ScalerMode::Hybrid => write!(f, "Hybrid"),
            ScalerMode::Native => write!(f, "Native"),
        }
    }
}

/// Scaled pointer delta
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledSample {
    pub dx: f64,
    pub dy: f64,
    pub scaling_factor: f64,
}

/// Scaler errors
#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    #[error("DPI {dpi} outside valid range [{MIN_DPI}, {MAX_DPI}]")]
    InvalidDpi { dpi: u32 },

    #[error("Base DPI must be positive, got {dpi}")]
    InvalidBaseDpi { dpi: u32 },

    #[error("Pointer speed adjustment failed: {0}")]
    AdjusterError(String),
}

/// Collaborator interface for OS-level pointer-speed changes (HYBRID mode)
pub trait PointerSpeedAdjuster: Send + Sync + 'static {
    fn apply_pointer_speed(&self, scaling_factor: f64) -> Result<(), ScalerError>;
}

/// Software DPI scaler
///
/// Pure per-channel transform; one instance per device worker, no shared
/// state. Samples pass through in input order.
pub struct DpiScaler {
    base_dpi: u32,
    target_dpi: u32,
    mode: ScalerMode,
    pre_smoothing: bool,
    history: VecDeque<(f64, f64)>,
    adjuster: Option<Arc<dyn PointerSpeedAdjuster>>,
}

impl DpiScaler {
    /// Creates a scaler with target DPI equal to the device's base DPI
    pub fn new(base_dpi: u32) -> Result<Self, ScalerError> {
        if base_dpi == 0 {
            return Err(ScalerError::InvalidBaseDpi { dpi: base_dpi });
        }
        info!("Creating DPI scaler with base DPI {}", base_dpi);
        Ok(Self {
            base_dpi,
            target_dpi: base_dpi,
            mode: ScalerMode::Software,
            pre_smoothing: false,
            history: VecDeque::with_capacity(3),
            adjuster: None,
        })
    }

    /// Installs the collaborator used by HYBRID mode
    pub fn with_adjuster(mut self, adjuster: Arc<dyn PointerSpeedAdjuster>) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    /// Enables or disables the 3-sample weighted pre-smoothing pass
    pub fn set_pre_smoothing(&mut self, enabled: bool) {
        if !enabled {
            self.history.clear();
        }
        self.pre_smoothing = enabled;
    }

    /// Sets the target virtual DPI
    ///
    /// Values outside `[400, 26000]` are rejected and the current DPI is left
    /// unchanged. In HYBRID mode the collaborator is notified of the new
    /// scaling factor; a collaborator failure is logged but does not undo the
    /// accepted DPI change.
    pub fn set_dpi(&mut self, dpi: u32) -> Result<(), ScalerError> {
        if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
            warn!("Rejected DPI {} outside [{}, {}]", dpi, MIN_DPI, MAX_DPI);
            return Err(ScalerError::InvalidDpi { dpi });
        }
        self.target_dpi = dpi;
        info!(
            "Target DPI set to {} (scaling factor {:.4})",
            dpi,
            self.scaling_factor()
        );

        if self.mode == ScalerMode::Hybrid {
            if let Some(adjuster) = &self.adjuster {
                if let Err(e) = adjuster.apply_pointer_speed(self.scaling_factor()) {
                    warn!("Pointer speed adjuster failed: {}", e);
                }
            }
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ScalerMode) {
        debug!("Scaler mode: {} -> {}", self.mode, mode);
        self.mode = mode;
    }

    pub fn current_dpi(&self) -> u32 {
        self.target_dpi
    }

    pub fn base_dpi(&self) -> u32 {
        self.base_dpi
    }

    pub fn mode(&self) -> ScalerMode {
        self.mode
    }

    /// Exact scaling factor `target_dpi / base_dpi` (1.0 in NATIVE mode)
    pub fn scaling_factor(&self) -> f64 {
        match self.mode {
            ScalerMode::Native => 1.0,
            _ => f64::from(self.target_dpi) / f64::from(self.base_dpi),
        }
    }

    /// Scales one raw delta pair
    pub fn scale(&mut self, dx: i32, dy: i32) -> ScaledSample {
        let (raw_x, raw_y) = (f64::from(dx), f64::from(dy));

        let (in_x, in_y) = if self.pre_smoothing {
            if self.history.len() == 3 {
                self.history.pop_front();
            }
            self.history.push_back((raw_x, raw_y));
            if self.history.len() == 3 {
                let mut sx = 0.0;
                let mut sy = 0.0;
                for (weight, (hx, hy)) in PRE_SMOOTH_WEIGHTS.iter().zip(self.history.iter()) {
                    sx += weight * hx;
                    sy += weight * hy;
                }
                (sx, sy)
            } else {
                (raw_x, raw_y)
            }
        } else {
            (raw_x, raw_y)
        };

        let factor = self.scaling_factor();
        ScaledSample {
            dx: in_x * factor,
            dy: in_y * factor,
            scaling_factor: factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn scaling_factor_is_exact_division() {
        let mut scaler = DpiScaler::new(800).unwrap();
        for dpi in [MIN_DPI, 800, 1600, 12_345, MAX_DPI] {
            scaler.set_dpi(dpi).unwrap();
            assert_eq!(scaler.scaling_factor(), f64::from(dpi) / 800.0);
        }
    }

    #[test]
    fn doubling_dpi_doubles_deltas() {
        let mut scaler = DpiScaler::new(800).unwrap();
        scaler.set_dpi(1600).unwrap();
        assert_eq!(scaler.scaling_factor(), 2.0);
        let out = scaler.scale(10, -5);
        assert_eq!(out.dx, 20.0);
        assert_eq!(out.dy, -10.0);
    }

    #[test]
    fn out_of_range_dpi_is_rejected_state_unchanged() {
        let mut scaler = DpiScaler::new(800).unwrap();
        scaler.set_dpi(1600).unwrap();
        for bad in [0, MIN_DPI - 1, MAX_DPI + 1, u32::MAX] {
            assert!(matches!(
                scaler.set_dpi(bad),
                Err(ScalerError::InvalidDpi { .. })
            ));
            assert_eq!(scaler.current_dpi(), 1600);
            assert_eq!(scaler.scaling_factor(), 2.0);
        }
    }

    #[test]
    fn boundary_dpi_values_are_accepted() {
        let mut scaler = DpiScaler::new(800).unwrap();
        assert!(scaler.set_dpi(MIN_DPI).is_ok());
        assert!(scaler.set_dpi(MAX_DPI).is_ok());
    }

    #[test]
    fn native_mode_forces_unit_factor() {
        let mut scaler = DpiScaler::new(800).unwrap();
        scaler.set_dpi(3200).unwrap();
        scaler.set_mode(ScalerMode::Native);
        assert_eq!(scaler.scaling_factor(), 1.0);
        let out = scaler.scale(7, 9);
        assert_eq!(out.dx, 7.0);
        assert_eq!(out.dy, 9.0);
    }

    #[test]
    fn pre_smoothing_blends_last_three_samples() {
        let mut scaler = DpiScaler::new(800).unwrap();
        scaler.set_pre_smoothing(true);
        // First two samples pass through raw, the window is not yet full.
        assert_eq!(scaler.scale(10, 0).dx, 10.0);
        assert_eq!(scaler.scale(20, 0).dx, 20.0);
        // 0.1*10 + 0.3*20 + 0.6*30 = 25
        let out = scaler.scale(30, 0);
        assert!((out.dx - 25.0).abs() < 1e-12);
    }

    #[test]
    fn hybrid_mode_invokes_adjuster() {
        struct CountingAdjuster(AtomicU32);
        impl PointerSpeedAdjuster for CountingAdjuster {
            fn apply_pointer_speed(&self, _factor: f64) -> Result<(), ScalerError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let adjuster = Arc::new(CountingAdjuster(AtomicU32::new(0)));
        let mut scaler = DpiScaler::new(800)
            .unwrap()
            .with_adjuster(adjuster.clone());

        scaler.set_dpi(1600).unwrap();
        assert_eq!(adjuster.0.load(Ordering::SeqCst), 0);

        scaler.set_mode(ScalerMode::Hybrid);
        scaler.set_dpi(3200).unwrap();
        assert_eq!(adjuster.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_base_dpi_is_a_construction_error() {
        assert!(matches!(
            DpiScaler::new(0),
            Err(ScalerError::InvalidBaseDpi { .. })
        ));
    }
}
