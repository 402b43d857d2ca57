//! # Dentate Patterns
//!
//! Generates the input patterns fed to pattern separation runs.
//!
//! A theta-modulated Poisson source provides the temporal pattern of the
//! perforant path input. It is binarized and smoothed into a base signal, and
//! every run activates a sliding window of cells of that base:
//!
//! ```text
//! run r:  rows [r, r + window) copied from the base, all other rows zero
//! ```
//!
//! Each run is persisted twice: the raw window and the window of the
//! row-normalized base (`_norm` suffix).

use dentate_analysis::{normalize_rows, time_stamps_to_signal, tri_filter};
use dentate_core::{check_poisson, AnalysisParams, DentateError, PoissonParams, Rate, Result, Signal, SpikeTimes, Time};
use ndarray::s;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Suffix of the row-normalized variant of an artifact
pub const NORM_SUFFIX: &str = "_norm";

/// Extension of persisted artifacts
pub const ARTIFACT_EXT: &str = "json";

// ============================================================================
// TEMPORAL PATTERN SOURCE
// ============================================================================

/// Inhomogeneous Poisson process with a sinusoidally modulated rate.
///
/// `rate(t) = max_rate / 2 * (1 + sin(2*pi*f*t - pi/2))`, so every train
/// starts at rate zero and peaks at `max_rate` half a cycle later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InhomogeneousPoisson {
    pub n_cells: usize,
    /// Train duration (ms)
    pub duration: Time,
    /// Modulation frequency (Hz)
    pub modulation_rate: Rate,
    /// Peak rate (Hz)
    pub max_rate: Rate,
}

impl From<&PoissonParams> for InhomogeneousPoisson {
    fn from(p: &PoissonParams) -> Self {
        Self {
            n_cells: p.n_cells,
            duration: p.duration,
            modulation_rate: p.modulation_rate,
            max_rate: p.max_rate,
        }
    }
}

impl InhomogeneousPoisson {
    /// Instantaneous rate (Hz) at `t` (ms)
    pub fn rate(&self, t: Time) -> Rate {
        let phase = 2.0 * std::f64::consts::PI * self.modulation_rate * t / 1000.0;
        self.max_rate / 2.0 * (1.0 + (phase - std::f64::consts::FRAC_PI_2).sin())
    }

    /// Sample one sorted spike train per cell, times in `[0, duration)` ms.
    ///
    /// Thinning of a homogeneous process at `max_rate`.
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SpikeTimes> {
        check_poisson(self.duration, self.modulation_rate, self.max_rate)?;
        if self.max_rate == 0.0 {
            return Ok(vec![Vec::new(); self.n_cells]);
        }

        // Inter-event intervals in ms
        let isi = Exp::new(self.max_rate / 1000.0)
            .map_err(|e| DentateError::InvalidParameter(format!("max_rate: {e}")))?;

        let trains: SpikeTimes = (0..self.n_cells)
            .map(|_| {
                let mut train = Vec::new();
                let mut t = isi.sample(rng);
                while t < self.duration {
                    if rng.gen::<f64>() * self.max_rate < self.rate(t) {
                        train.push(t);
                    }
                    t += isi.sample(rng);
                }
                train
            })
            .collect();

        debug!(
            cells = self.n_cells,
            spikes = trains.iter().map(Vec::len).sum::<usize>(),
            "sampled inhomogeneous Poisson trains"
        );
        Ok(trains)
    }
}

/// Deterministic RNG for a given seed
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

// ============================================================================
// ARTIFACT STORAGE
// ============================================================================

/// Destination for named signals
pub trait ArtifactSink: Sync {
    fn save(&self, name: &str, signal: &Signal) -> Result<()>;
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    name: &'a str,
    signal: &'a Signal,
}

/// Persisted signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub signal: Signal,
}

/// Directory of `<name>.json` artifacts.
///
/// Writes go through a temporary file in the same directory and are renamed
/// into place, so an artifact is either complete or absent.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open `root`, creating it if needed
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open an existing directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(DentateError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("artifact directory {} does not exist", root.display()),
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{ARTIFACT_EXT}"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    pub fn load(&self, name: &str) -> Result<Signal> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(DentateError::ArtifactNotFound(name.to_string()));
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let artifact: Artifact = serde_json::from_reader(reader)?;
        Ok(artifact.signal)
    }

    /// Names of all stored artifacts, sorted
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == ARTIFACT_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

impl ArtifactSink for ArtifactStore {
    fn save(&self, name: &str, signal: &Signal) -> Result<()> {
        let path = self.path_of(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &ArtifactRef { name, signal })?;
            writer.flush()?;
        }
        tmp.persist(&path).map_err(|e| DentateError::Io(e.error))?;
        debug!(path = %path.display(), shape = ?signal.dim(), "saved artifact");
        Ok(())
    }
}

// ============================================================================
// PATTERNS
// ============================================================================

/// Name of the artifact for `run`, zero padded to three digits
pub fn artifact_name(prefix: &str, run: usize) -> String {
    format!("{prefix}{run:03}")
}

/// Copy rows `[run, run + window)` of `base` into an otherwise zero signal.
///
/// The window is clipped at the last row; a run past the end yields zeros.
pub fn pattern_window(base: &Signal, run: usize, window: usize) -> Signal {
    let n = base.nrows();
    let start = run.min(n);
    let end = run.saturating_add(window).min(n);

    let mut pattern = Signal::zeros(base.raw_dim());
    pattern
        .slice_mut(s![start..end, ..])
        .assign(&base.slice(s![start..end, ..]));
    pattern
}

/// Binarize and smooth spike trains into the base temporal pattern
pub fn build_base_pattern(time_stamps: &[Vec<Time>], params: &AnalysisParams) -> Result<Signal> {
    let binary = time_stamps_to_signal(
        time_stamps,
        params.dt_signal,
        params.t_start,
        params.t_stop,
    )?;
    tri_filter(&binary, params.kernel_width)
}

/// A run whose artifacts could not be written
#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub run: usize,
    pub name: String,
    pub error: String,
}

/// Outcome of a pattern batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Artifacts written, sorted by name
    pub written: Vec<String>,
    /// Failed runs, sorted by run index
    pub failed: Vec<RunFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Write the raw and normalized pattern of every run.
pub fn generate_patterns<S: ArtifactSink>(
    base: &Signal,
    params: &AnalysisParams,
    sink: &S,
) -> BatchReport {
    generate_patterns_with(base, params, sink, |_| {})
}

/// [`generate_patterns`] with a callback invoked once per finished run.
///
/// Runs are written in parallel. A failed write is reported for its run
/// only; other runs are unaffected.
pub fn generate_patterns_with<S, F>(
    base: &Signal,
    params: &AnalysisParams,
    sink: &S,
    on_run: F,
) -> BatchReport
where
    S: ArtifactSink,
    F: Fn(usize) + Sync,
{
    let base_norm = normalize_rows(base);
    info!(
        runs = params.runs,
        window = params.window,
        shape = ?base.dim(),
        "generating input patterns"
    );

    let outcomes: Vec<(usize, std::result::Result<Vec<String>, RunFailure>)> = (0..params.runs)
        .into_par_iter()
        .map(|run| {
            let outcome = write_run(base, &base_norm, run, params, sink);
            on_run(run);
            (run, outcome)
        })
        .collect();

    let mut report = BatchReport::default();
    for (run, outcome) in outcomes {
        match outcome {
            Ok(names) => report.written.extend(names),
            Err(failure) => {
                warn!(run, name = %failure.name, error = %failure.error, "failed to write pattern");
                report.failed.push(failure);
            }
        }
    }
    report.written.sort();

    info!(
        written = report.written.len(),
        failed = report.failed.len(),
        "pattern generation finished"
    );
    report
}

fn write_run<S: ArtifactSink>(
    base: &Signal,
    base_norm: &Signal,
    run: usize,
    params: &AnalysisParams,
    sink: &S,
) -> std::result::Result<Vec<String>, RunFailure> {
    let name = artifact_name(&params.file_prefix, run);
    let norm_name = format!("{name}{NORM_SUFFIX}");

    let fail = |name: &str, e: DentateError| RunFailure {
        run,
        name: name.to_string(),
        error: e.to_string(),
    };

    sink.save(&name, &pattern_window(base, run, params.window))
        .map_err(|e| fail(&name, e))?;
    sink.save(&norm_name, &pattern_window(base_norm, run, params.window))
        .map_err(|e| fail(&norm_name, e))?;

    Ok(vec![name, norm_name])
}

/// Sample the Poisson source with its configured seed and build the base pattern
pub fn sample_base_pattern(params: &AnalysisParams) -> Result<Signal> {
    let mut rng = seeded_rng(params.poisson.seed);
    let trains = InhomogeneousPoisson::from(&params.poisson).generate(&mut rng)?;
    build_base_pattern(&trains, params)
}

// ============================================================================
// SPIKE DATA EXPORT
// ============================================================================

/// Persist simulator spike times as `<name>_spike_data` (binarized) and
/// `<name>_spike_data_convolved` (smoothed).
pub fn export_spike_data<S: ArtifactSink>(
    time_stamps: &[Vec<Time>],
    params: &AnalysisParams,
    sink: &S,
    name: &str,
) -> Result<(Signal, Signal)> {
    let binary = time_stamps_to_signal(
        time_stamps,
        params.dt_signal,
        params.t_start,
        params.t_stop,
    )?;
    let smooth = tri_filter(&binary, params.kernel_width)?;

    sink.save(&format!("{name}_spike_data"), &binary)?;
    sink.save(&format!("{name}_spike_data_convolved"), &smooth)?;
    info!(name, shape = ?binary.dim(), "exported spike data");
    Ok((binary, smooth))
}

/// Read a JSON list of per-cell spike time lists
pub fn read_spike_times(path: impl AsRef<Path>) -> Result<SpikeTimes> {
    let reader = BufReader::new(fs::File::open(path.as_ref())?);
    Ok(serde_json::from_reader(reader)?)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_params() -> AnalysisParams {
        AnalysisParams {
            dt_signal: 1.0,
            t_start: 0.0,
            t_stop: 100.0,
            kernel_width: 10,
            runs: 4,
            window: 24,
            poisson: PoissonParams {
                n_cells: 30,
                duration: 100.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ramp(rows: usize, cols: usize) -> Signal {
        Array2::from_shape_fn((rows, cols), |(i, j)| (i + 1) as f64 + j as f64)
    }

    #[test]
    fn test_rate_profile() {
        let src = InhomogeneousPoisson::from(&PoissonParams::default());
        assert!(src.rate(0.0).abs() < 1e-9);
        assert!((src.rate(50.0) - 100.0).abs() < 1e-9);
        assert!(src.rate(100.0).abs() < 1e-9);
    }

    #[test]
    fn test_poisson_reproducible() {
        let src = InhomogeneousPoisson::from(&PoissonParams::default());

        let a = src.generate(&mut seeded_rng(10000)).unwrap();
        let b = src.generate(&mut seeded_rng(10000)).unwrap();
        let c = src.generate(&mut seeded_rng(1)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 400);
    }

    #[test]
    fn test_poisson_trains_sorted_and_in_range() {
        let src = InhomogeneousPoisson::from(&PoissonParams::default());
        let trains = src.generate(&mut seeded_rng(3)).unwrap();

        for train in &trains {
            assert!(train.windows(2).all(|w| w[0] < w[1]));
            assert!(train.iter().all(|&t| (0.0..500.0).contains(&t)));
        }

        // Mean rate is max_rate / 2 = 50 Hz over 0.5 s
        let mean = trains.iter().map(Vec::len).sum::<usize>() as f64 / trains.len() as f64;
        assert!(mean > 20.0 && mean < 30.0, "mean spikes per cell {mean}");
    }

    #[test]
    fn test_poisson_silent_and_invalid() {
        let silent = InhomogeneousPoisson {
            n_cells: 3,
            duration: 100.0,
            modulation_rate: 10.0,
            max_rate: 0.0,
        };
        assert_eq!(silent.generate(&mut seeded_rng(0)).unwrap(), vec![Vec::<f64>::new(); 3]);

        let invalid = InhomogeneousPoisson { duration: 0.0, ..silent.clone() };
        assert!(invalid.generate(&mut seeded_rng(0)).is_err());
    }

    #[test]
    fn test_poisson_rejects_non_finite() {
        let base = InhomogeneousPoisson::from(&PoissonParams::default());
        for src in [
            InhomogeneousPoisson { max_rate: f64::INFINITY, ..base.clone() },
            InhomogeneousPoisson { duration: f64::INFINITY, ..base.clone() },
            InhomogeneousPoisson { modulation_rate: f64::NAN, ..base.clone() },
        ] {
            assert!(matches!(
                src.generate(&mut seeded_rng(1)),
                Err(DentateError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("input_patterns_run_", 7), "input_patterns_run_007");
        assert_eq!(artifact_name("p", 375), "p375");
        assert_eq!(artifact_name("p", 1234), "p1234");
    }

    #[test]
    fn test_pattern_window_interior() {
        let base = ramp(30, 3);
        let p = pattern_window(&base, 2, 5);
        for i in 0..30 {
            let expected = if (2..7).contains(&i) { base.row(i).to_owned() } else { ndarray::Array1::zeros(3) };
            assert_eq!(p.row(i), expected);
        }
    }

    #[test]
    fn test_pattern_window_clips_at_tail() {
        let base = ramp(30, 4);
        let p = pattern_window(&base, 10, 24);

        assert_eq!(p.dim(), (30, 4));
        assert!(p.slice(s![0..10, ..]).iter().all(|&v| v == 0.0));
        assert_eq!(p.slice(s![10..30, ..]), base.slice(s![10..30, ..]));

        let active = p.outer_iter().filter(|r| r.iter().any(|&v| v != 0.0)).count();
        assert_eq!(active, 20);

        let past_end = pattern_window(&base, 40, 24);
        assert!(past_end.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_store_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("patterns")).unwrap();

        let sig = ramp(3, 2);
        store.save("a", &sig).unwrap();
        assert!(store.contains("a"));
        assert_eq!(store.load("a").unwrap(), sig);
        assert_eq!(store.names().unwrap(), vec!["a".to_string()]);

        assert!(matches!(
            store.load("missing"),
            Err(DentateError::ArtifactNotFound(_))
        ));

        let reopened = ArtifactStore::open(store.root()).unwrap();
        assert_eq!(reopened.load("a").unwrap(), sig);
        assert!(ArtifactStore::open(dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_generate_patterns_writes_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let params = AnalysisParams { runs: 3, window: 24, ..small_params() };
        let base = ramp(30, 5);

        let report = generate_patterns(&base, &params, &store);
        assert!(report.is_complete());
        assert_eq!(report.written.len(), 6);
        assert_eq!(store.names().unwrap(), report.written);

        let p = store.load("input_patterns_run_002").unwrap();
        assert_eq!(p, pattern_window(&base, 2, 24));

        let norm = store.load("input_patterns_run_002_norm").unwrap();
        for (i, row) in norm.outer_iter().enumerate() {
            let len = row.dot(&row).sqrt();
            if (2..26).contains(&i) {
                assert!((len - 1.0).abs() < 1e-12);
            } else {
                assert_eq!(len, 0.0);
            }
        }
    }

    #[test]
    fn test_failed_write_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let params = AnalysisParams { runs: 3, ..small_params() };

        // A directory squatting on the target path makes the rename fail
        fs::create_dir(store.path_of("input_patterns_run_001")).unwrap();

        let report = generate_patterns(&ramp(30, 5), &params, &store);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].run, 1);
        assert_eq!(report.failed[0].name, "input_patterns_run_001");
        assert_eq!(report.written.len(), 4);
        assert!(store.contains("input_patterns_run_000_norm"));
        assert!(store.contains("input_patterns_run_002"));
        assert!(!store.contains("input_patterns_run_001_norm"));

        // No temporary files left behind
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, report.written.len() + 1);
    }

    struct FlakySink {
        saved: AtomicUsize,
    }

    impl ArtifactSink for FlakySink {
        fn save(&self, name: &str, _signal: &Signal) -> Result<()> {
            if name.ends_with(NORM_SUFFIX) && name.contains("_003") {
                return Err(DentateError::Io(std::io::Error::other("disk full")));
            }
            self.saved.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_progress_and_norm_failure() {
        let sink = FlakySink { saved: AtomicUsize::new(0) };
        let finished = AtomicUsize::new(0);
        let params = AnalysisParams { runs: 5, ..small_params() };

        let report = generate_patterns_with(&ramp(30, 2), &params, &sink, |_| {
            finished.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(finished.load(Ordering::SeqCst), 5);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "input_patterns_run_003_norm");
        assert!(report.failed[0].error.contains("disk full"));
        // Raw pattern of run 3 was still saved
        assert_eq!(sink.saved.load(Ordering::SeqCst), 9);
        assert_eq!(report.written.len(), 8);
    }

    #[test]
    fn test_sampled_base_pattern_end_to_end() {
        let params = small_params();
        let base = sample_base_pattern(&params).unwrap();
        assert_eq!(base.dim(), (30, 100));
        assert_eq!(base, sample_base_pattern(&params).unwrap());
        assert!(base.iter().all(|&v| v >= 0.0));

        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let report = generate_patterns(&base, &params, &store);
        assert!(report.is_complete());
        assert_eq!(report.written.len(), 2 * params.runs);
    }

    #[test]
    fn test_export_spike_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(dir.path()).unwrap();
        let times_path = dir.path().join("times.txt");
        fs::write(&times_path, "[[1.5, 40.0], [], [99.0]]").unwrap();

        let times = read_spike_times(&times_path).unwrap();
        let (binary, smooth) = export_spike_data(&times, &small_params(), &store, "net").unwrap();

        assert_eq!(binary.sum(), 3.0);
        assert_eq!(smooth.dim(), (3, 100));
        assert_eq!(store.load("net_spike_data").unwrap(), binary);
        assert_eq!(store.load("net_spike_data_convolved").unwrap(), smooth);

        let late = vec![vec![150.0]];
        assert!(matches!(
            export_spike_data(&late, &small_params(), &store, "late"),
            Err(DentateError::OutOfRange { cell: 0, .. })
        ));
        assert!(!store.contains("late_spike_data"));
    }
}
