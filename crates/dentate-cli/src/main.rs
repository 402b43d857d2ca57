//! # Dentate CLI
//!
//! Command-line interface for input pattern generation and spike-train analysis.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dentate_analysis::{avg_dotprod_signals, avg_dotprod_signals_tbinned, correlate_signals};
use dentate_core::AnalysisParams;
use dentate_patterns::{
    export_spike_data, generate_patterns_with, read_spike_times, sample_base_pattern,
    ArtifactStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dentate")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Dentate gyrus input patterns and spike-train analysis", long_about = None)]
struct Cli {
    /// Parameter file (JSON); defaults are used for missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample the theta-modulated input and write one pattern per run
    Generate {
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
        /// Override the Poisson seed
        #[arg(long)]
        seed: Option<u64>,
        /// Override the number of runs
        #[arg(long)]
        runs: Option<usize>,
    },

    /// Binarize and smooth simulator spike times (JSON list of lists)
    Convert {
        /// Spike times file
        times: PathBuf,
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,
        /// Artifact name prefix
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Compare two stored signals
    Compare {
        /// Artifact directory
        dir: PathBuf,
        /// First artifact name
        first: String,
        /// Second artifact name
        second: String,
        /// Columns per bin for the binned similarity
        #[arg(long)]
        len_bin: Option<usize>,
    },

    /// Print the effective parameters
    Params,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_params(config: Option<&Path>) -> anyhow::Result<AnalysisParams> {
    match config {
        Some(path) => AnalysisParams::from_json_file(path)
            .with_context(|| format!("reading parameters from {}", path.display())),
        None => Ok(AnalysisParams::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let mut params = load_params(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate { out, seed, runs } => {
            if let Some(seed) = seed {
                params.poisson.seed = seed;
            }
            if let Some(runs) = runs {
                params.runs = runs;
            }
            params.validate()?;

            println!("{} {}", "Generating input patterns in:".green().bold(), out.display());
            println!(
                "  {} runs, window {}, seed {}",
                params.runs.to_string().cyan(),
                params.window.to_string().cyan(),
                params.poisson.seed.to_string().cyan()
            );

            let base = sample_base_pattern(&params)?;
            let store = ArtifactStore::create(&out)?;

            let bar = ProgressBar::new(params.runs as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} runs ({eta})")?,
            );
            let report = generate_patterns_with(&base, &params, &store, |_| bar.inc(1));
            bar.finish_and_clear();

            println!("{} {}", "Artifacts written:".green().bold(), report.written.len());
            for failure in &report.failed {
                println!(
                    "  {} run {:03} ({}): {}",
                    "failed".red().bold(),
                    failure.run,
                    failure.name,
                    failure.error
                );
            }
            if !report.is_complete() {
                anyhow::bail!("{} of {} runs failed", report.failed.len(), params.runs);
            }
        }

        Commands::Convert { times, out, name } => {
            let name = name.unwrap_or_else(|| {
                times
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "spikes".to_string())
            });
            println!("{} {}", "Converting spike times:".green().bold(), times.display());

            let stamps = read_spike_times(&times)
                .with_context(|| format!("reading spike times from {}", times.display()))?;
            let store = ArtifactStore::create(&out)?;
            let (binary, _) = export_spike_data(&stamps, &params, &store, &name)?;

            println!(
                "  {} cells x {} bins -> {}",
                binary.nrows(),
                binary.ncols(),
                out.display().to_string().cyan()
            );
        }

        Commands::Compare {
            dir,
            first,
            second,
            len_bin,
        } => {
            let store = ArtifactStore::open(&dir)?;
            let a = store.load(&first)?;
            let b = store.load(&second)?;
            let len_bin = len_bin.unwrap_or(params.len_bin);

            println!("{} {} vs {}", "Comparing:".green().bold(), first.cyan(), second.cyan());
            println!("  correlation:        {:.6}", correlate_signals(&a, &b)?);
            println!("  avg dot product:    {:.6}", avg_dotprod_signals(&a, &b)?);
            let binned = avg_dotprod_signals_tbinned(&a, &b, len_bin)?;
            let binned: Vec<String> = binned.iter().map(|v| format!("{v:.6}")).collect();
            println!("  binned dot product: [{}]", binned.join(", "));
        }

        Commands::Params => {
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
    }

    Ok(())
}
