//! # Dentate Core
//!
//! Shared types and utilities for the dentate gyrus analysis toolkit.
//!
//! ## Pipeline
//!
//! | Stage | Input | Output |
//! |-------|-------|--------|
//! | Binarizer | spike timestamps | 0/1 signal |
//! | Triangular filter | signal | smoothed signal |
//! | Similarity | two signals | scalar / per-bin scores |
//! | Pattern generator | base signal | one artifact per run |
//!
//! ## Conventions
//!
//! 1. Signals are `cells x time bins`
//! 2. Transforms never mutate their input
//! 3. Silent cells yield [`Measure::Undefined`], never zero

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum DentateError {
    #[error("Spike of cell {cell} at t={time} outside [{t_start}, {t_stop})")]
    OutOfRange {
        cell: usize,
        time: Time,
        t_start: Time,
        t_stop: Time,
    },

    #[error("Shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DentateError>;

/// Time point (ms)
pub type Time = f64;

/// Rate (Hz)
pub type Rate = f64;

/// Per-cell spike times, one (possibly empty) sequence per cell
pub type SpikeTimes = Vec<Vec<Time>>;

/// Dense signal matrix: rows are cells, columns are time bins
pub type Signal = Array2<f64>;

/// Fail unless both signals have the same `(cells, bins)` shape
pub fn check_same_shape(a: &Signal, b: &Signal) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(DentateError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    Ok(())
}

// ============================================================================
// MEASURES
// ============================================================================

/// Similarity of one cell (or one cell/bin pair).
///
/// Silent cells have no meaningful similarity. They are tagged rather than
/// encoded as NaN so aggregation can skip them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Measure {
    Defined(f64),
    #[default]
    Undefined,
}

impl Measure {
    /// `num / den`, undefined when the denominator vanishes
    pub fn ratio(num: f64, den: f64) -> Self {
        if den == 0.0 || !den.is_finite() {
            Self::Undefined
        } else {
            Self::Defined(num / den)
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Defined(v) => Some(*v),
            Self::Undefined => None,
        }
    }

    /// NaN representation for callers that want plain floats
    pub fn to_f64(&self) -> f64 {
        self.value().unwrap_or(f64::NAN)
    }
}

/// Mean over the defined measures; undefined when none is defined
pub fn mean_defined<'a, I>(measures: I) -> Measure
where
    I: IntoIterator<Item = &'a Measure>,
{
    let (sum, count) = measures
        .into_iter()
        .filter_map(Measure::value)
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));

    if count == 0 {
        Measure::Undefined
    } else {
        Measure::Defined(sum / count as f64)
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Analysis and pattern generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// Bin width of binarized signals (ms)
    pub dt_signal: Time,
    /// Start of the analysed window (ms)
    pub t_start: Time,
    /// End of the analysed window, exclusive (ms)
    pub t_stop: Time,
    /// Triangular kernel width (bins)
    pub kernel_width: usize,
    /// Columns per bin for the time-binned similarity
    pub len_bin: usize,
    /// Number of patterns to generate
    pub runs: usize,
    /// Active cells per pattern
    pub window: usize,
    /// Artifact name prefix
    pub file_prefix: String,
    /// Temporal pattern source
    pub poisson: PoissonParams,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            dt_signal: 0.1,
            t_start: 0.0,
            t_stop: 600.0,
            kernel_width: 200,
            len_bin: 1000,
            runs: 376,
            window: 24,
            file_prefix: "input_patterns_run_".to_string(),
            poisson: PoissonParams::default(),
        }
    }
}

impl AnalysisParams {
    /// Load parameters from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "loaded analysis parameters");
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.dt_signal > 0.0) || !self.dt_signal.is_finite() {
            return Err(DentateError::InvalidParameter(format!(
                "dt_signal must be positive, got {}",
                self.dt_signal
            )));
        }
        if !(self.t_stop > self.t_start) || !self.t_start.is_finite() || !self.t_stop.is_finite() {
            return Err(DentateError::InvalidParameter(format!(
                "t_stop ({}) must exceed t_start ({})",
                self.t_stop, self.t_start
            )));
        }
        if self.kernel_width == 0 {
            return Err(DentateError::InvalidParameter("kernel_width must be > 0".into()));
        }
        if self.len_bin == 0 {
            return Err(DentateError::InvalidParameter("len_bin must be > 0".into()));
        }
        if self.window == 0 {
            return Err(DentateError::InvalidParameter("window must be > 0".into()));
        }
        self.poisson.validate()?;
        // Sampled trains cover [0, duration) and must binarize without loss
        if self.t_start > 0.0 || self.poisson.duration > self.t_stop {
            return Err(DentateError::InvalidParameter(format!(
                "poisson.duration [0, {}) must lie within [t_start, t_stop) = [{}, {})",
                self.poisson.duration, self.t_start, self.t_stop
            )));
        }
        Ok(())
    }
}

/// Theta-modulated inhomogeneous Poisson input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoissonParams {
    pub n_cells: usize,
    /// Duration of each spike train (ms)
    pub duration: Time,
    /// Modulation frequency (Hz)
    pub modulation_rate: Rate,
    /// Peak rate (Hz)
    pub max_rate: Rate,
    pub seed: u64,
}

impl Default for PoissonParams {
    fn default() -> Self {
        Self {
            n_cells: 400,
            duration: 500.0,
            modulation_rate: 10.0,
            max_rate: 100.0,
            seed: 10000,
        }
    }
}

impl PoissonParams {
    pub fn validate(&self) -> Result<()> {
        check_poisson(self.duration, self.modulation_rate, self.max_rate)
    }
}

/// Duration must be positive and finite, rates non-negative and finite
pub fn check_poisson(duration: Time, modulation_rate: Rate, max_rate: Rate) -> Result<()> {
    if !(duration > 0.0) || !duration.is_finite() {
        return Err(DentateError::InvalidParameter(format!(
            "duration must be positive and finite, got {duration}"
        )));
    }
    for (name, rate) in [("max_rate", max_rate), ("modulation_rate", modulation_rate)] {
        if !(rate >= 0.0) || !rate.is_finite() {
            return Err(DentateError::InvalidParameter(format!(
                "{name} must be non-negative and finite, got {rate}"
            )));
        }
    }
    Ok(())
}
