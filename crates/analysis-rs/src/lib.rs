//! # Dentate Analysis
//!
//! Offline analysis of spike trains recorded from dentate gyrus simulations.
//!
//! Every transform works on signals of shape `(cells, time bins)`:
//! - Binarization of ragged spike timestamps into 0/1 occupancy
//! - Triangular smoothing into rate-like traces
//! - Similarity metrics used to quantify pattern separation
//!
//! ```
//! use dentate_analysis::{time_stamps_to_signal, avg_dotprod_signals};
//!
//! let a = time_stamps_to_signal(&[vec![5.0, 15.0, 25.0]], 10.0, 0.0, 30.0).unwrap();
//! assert_eq!(a.row(0).to_vec(), vec![1.0, 1.0, 1.0]);
//! assert_eq!(avg_dotprod_signals(&a, &a).unwrap(), 3.0);
//! ```

use dentate_core::{check_same_shape, mean_defined, DentateError, Measure, Result, Signal, Time};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayViewMut1};
use tracing::debug;

/// Upper bound on the number of time bins of a binarized signal
pub const MAX_BINS: usize = 1 << 31;

/// Number of leading time bins kept by [`avg_dotprod_signals_tbinned`]
pub const MAX_TIME_BINS: usize = 5;

// ============================================================================
// BINARIZER
// ============================================================================

/// Number of bins of width `dt` covering `[t_start, t_stop)`.
///
/// Ratios within rounding noise of an integer are not bumped up by `ceil`
/// (`600.0 / 0.1` must give 6000 bins, not 6001).
pub fn num_bins(dt: Time, t_start: Time, t_stop: Time) -> Result<usize> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(DentateError::InvalidParameter(format!(
            "bin width must be positive, got {dt}"
        )));
    }
    if !(t_stop > t_start) {
        return Err(DentateError::InvalidParameter(format!(
            "t_stop ({t_stop}) must exceed t_start ({t_start})"
        )));
    }

    let ratio = (t_stop - t_start) / dt;
    let nearest = ratio.round();
    let n = if (ratio - nearest).abs() < 1e-9 * nearest.max(1.0) {
        nearest
    } else {
        ratio.ceil()
    };
    if !n.is_finite() || n > MAX_BINS as f64 {
        return Err(DentateError::InvalidParameter(format!(
            "[{t_start}, {t_stop}) at dt={dt} needs {n} bins, limit is {MAX_BINS}"
        )));
    }
    Ok(n as usize)
}

/// Convert per-cell spike timestamps into a 0/1 signal.
///
/// Bin `j` of cell `i` is 1 when cell `i` spiked at least once in
/// `[t_start + j*dt, t_start + (j+1)*dt)`. Spikes outside `[t_start, t_stop)`
/// are rejected with [`DentateError::OutOfRange`].
pub fn time_stamps_to_signal(
    time_stamps: &[Vec<Time>],
    dt_signal: Time,
    t_start: Time,
    t_stop: Time,
) -> Result<Signal> {
    let n_bins = num_bins(dt_signal, t_start, t_stop)?;
    if time_stamps.len().checked_mul(n_bins).is_none() {
        return Err(DentateError::InvalidParameter(format!(
            "{} cells x {n_bins} bins overflows",
            time_stamps.len()
        )));
    }
    let mut signal = Signal::zeros((time_stamps.len(), n_bins));

    for (cell, times) in time_stamps.iter().enumerate() {
        for &time in times {
            if !(time >= t_start && time < t_stop) {
                return Err(DentateError::OutOfRange {
                    cell,
                    time,
                    t_start,
                    t_stop,
                });
            }
            // Rounding can land a spike just below t_stop on index n_bins
            let idx = (((time - t_start) / dt_signal).floor() as usize).min(n_bins - 1);
            signal[[cell, idx]] = 1.0;
        }
    }

    debug!(
        cells = time_stamps.len(),
        bins = n_bins,
        "binarized spike timestamps"
    );
    Ok(signal)
}

// ============================================================================
// TRIANGULAR FILTER
// ============================================================================

/// Triangular kernel of length `width + 1`, zero at both ends, peak `width / 2`.
pub fn tri_kernel(width: usize) -> Result<Array1<f64>> {
    if width == 0 {
        return Err(DentateError::InvalidParameter(
            "kernel width must be > 0".into(),
        ));
    }
    let half = width as f64 / 2.0;
    Ok(Array1::from_shape_fn(width + 1, |i| half - (i as f64 - half).abs()))
}

/// Smooth every row of `signal` with a triangular kernel of `kernel_width` bins.
///
/// Zero padded, output has the input's shape (numpy `convolve(.., 'same')`
/// centring).
pub fn tri_filter(signal: &Signal, kernel_width: usize) -> Result<Signal> {
    let kernel = tri_kernel(kernel_width)?;
    let mut out = Signal::zeros(signal.raw_dim());

    for (row, out_row) in signal.outer_iter().zip(out.outer_iter_mut()) {
        convolve_same(row, &kernel, out_row);
    }

    debug!(shape = ?signal.dim(), kernel_width, "applied triangular filter");
    Ok(out)
}

/// Scatter each non-zero sample through the kernel. Spike signals are sparse.
fn convolve_same(x: ArrayView1<f64>, kernel: &Array1<f64>, mut out: ArrayViewMut1<f64>) {
    let n = x.len();
    let offset = (kernel.len() - 1) / 2;

    for (j, &v) in x.iter().enumerate() {
        if v == 0.0 {
            continue;
        }
        for (t, &k) in kernel.iter().enumerate() {
            // Full-convolution index j + t maps to output index j + t - offset
            let full = j + t;
            if full < offset {
                continue;
            }
            let i = full - offset;
            if i >= n {
                break;
            }
            out[i] += v * k;
        }
    }
}

/// L2-normalize every row. Silent rows stay zero.
pub fn normalize_rows(signal: &Signal) -> Signal {
    let mut out = signal.clone();
    for mut row in out.outer_iter_mut() {
        let norm = l2_norm(row.view());
        if norm > 0.0 {
            row /= norm;
        }
    }
    out
}

fn l2_norm(x: ArrayView1<f64>) -> f64 {
    x.dot(&x).sqrt()
}

fn is_silent(x: ArrayView1<f64>) -> bool {
    x.iter().all(|&v| v == 0.0)
}

// ============================================================================
// SIMILARITY METRICS
// ============================================================================

/// Population standard deviation (ddof = 0)
fn population_std(x: ArrayView1<f64>) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.sum() / n;
    (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Per-cell normalized correlation.
///
/// Each row is shifted by its own standard deviation (not its mean) before
/// the normalized dot product is taken. This matches earlier pattern
/// separation results and is not Pearson correlation. Rows with a vanishing
/// norm are undefined.
pub fn correlate_rows(signal1: &Signal, signal2: &Signal) -> Result<Vec<Measure>> {
    check_same_shape(signal1, signal2)?;

    let rows = signal1
        .outer_iter()
        .zip(signal2.outer_iter())
        .map(|(r1, r2)| {
            let (sd1, sd2) = (population_std(r1), population_std(r2));
            let sig1 = r1.mapv(|v| v - sd1);
            let sig2 = r2.mapv(|v| v - sd2);
            Measure::ratio(sig1.dot(&sig2), l2_norm(sig1.view()) * l2_norm(sig2.view()))
        })
        .collect();
    Ok(rows)
}

/// Mean of [`correlate_rows`] over cells where it is defined (NaN if none)
pub fn correlate_signals(signal1: &Signal, signal2: &Signal) -> Result<f64> {
    let rows = correlate_rows(signal1, signal2)?;
    Ok(mean_defined(&rows).to_f64())
}

/// Per-cell dot product; undefined for cells silent in both signals
pub fn dotprod_rows(signal1: &Signal, signal2: &Signal) -> Result<Vec<Measure>> {
    check_same_shape(signal1, signal2)?;

    let rows = signal1
        .outer_iter()
        .zip(signal2.outer_iter())
        .map(|(r1, r2)| {
            if is_silent(r1) && is_silent(r2) {
                Measure::Undefined
            } else {
                Measure::Defined(r1.dot(&r2))
            }
        })
        .collect();
    Ok(rows)
}

/// Average dot product over cells active in either signal (NaN if none)
pub fn avg_dotprod_signals(signal1: &Signal, signal2: &Signal) -> Result<f64> {
    let rows = dotprod_rows(signal1, signal2)?;
    Ok(mean_defined(&rows).to_f64())
}

/// Per-(cell, bin) normalized dot product over the first [`MAX_TIME_BINS`]
/// full bins of `len_bin` columns.
///
/// Each (cell, bin) slice is L2-normalized on its own; a zero slice stays
/// zero. Pairs silent in both signals are undefined.
pub fn dotprod_bins(signal1: &Signal, signal2: &Signal, len_bin: usize) -> Result<Array2<Measure>> {
    check_same_shape(signal1, signal2)?;
    if len_bin == 0 {
        return Err(DentateError::InvalidParameter("len_bin must be > 0".into()));
    }

    let (cells, cols) = signal1.dim();
    let n_bins = (cols / len_bin).min(MAX_TIME_BINS);

    let bins = Array2::from_shape_fn((cells, n_bins), |(cell, bin)| {
        let cols = bin * len_bin..(bin + 1) * len_bin;
        let x1 = signal1.slice(s![cell, cols.clone()]);
        let x2 = signal2.slice(s![cell, cols]);

        let n1 = l2_norm(x1);
        let n2 = l2_norm(x2);
        if n1 == 0.0 && n2 == 0.0 {
            return Measure::Undefined;
        }
        let n1 = if n1 > 0.0 { n1 } else { 1.0 };
        let n2 = if n2 > 0.0 { n2 } else { 1.0 };
        Measure::Defined(x1.dot(&x2) / (n1 * n2))
    });

    debug!(cells, bins = n_bins, len_bin, "computed binned dot products");
    Ok(bins)
}

/// Per-bin average of [`dotprod_bins`] over defined cells.
///
/// Returns `min(MAX_TIME_BINS, T / len_bin)` values; NaN for a bin where
/// every cell is silent in both signals.
pub fn avg_dotprod_signals_tbinned(
    signal1: &Signal,
    signal2: &Signal,
    len_bin: usize,
) -> Result<Vec<f64>> {
    let bins = dotprod_bins(signal1, signal2, len_bin)?;
    Ok(bins
        .columns()
        .into_iter()
        .map(|col| mean_defined(col.iter()).to_f64())
        .collect())
}

// ============================================================================
// TESTS
// ============================================================================
