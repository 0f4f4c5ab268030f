//! Command-line interface for the scan normalizer.

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;

use crate::config::NormalizerConfig;
use crate::processors::{normalize, sharding};
use crate::processors::{BatchReport, DatasetLayout, ScanOutcome};

#[derive(Parser)]
#[command(name = "scan-normalizer")]
#[command(about = "Align THuman2.0 scans to their fitted SMPL translation and scale", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Shard options used when no subcommand is given
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Dataset location overrides shared by subcommands.
#[derive(Args, Debug, Default)]
struct PathArgs {
    /// Root holding `<NNNN>/<NNNN>.obj` scans
    #[arg(long)]
    source: Option<PathBuf>,
    /// Root receiving aligned scans
    #[arg(long)]
    dest: Option<PathBuf>,
    /// Directory holding `<NNNN>_smpl.pkl` parameter files
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Shard handled by this process (0-based)
    #[arg(long, default_value_t = 0)]
    id: usize,
    /// Total number of shards
    #[arg(long, default_value_t = 1)]
    tot: usize,
    /// Remove output directories left empty by unreadable scans
    #[arg(long)]
    prune: bool,
    #[command(flatten)]
    paths: PathArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Normalize every scan in one shard of the dataset (the default)
    Run(RunArgs),

    /// Normalize a single scan
    Scan {
        /// Scan index, e.g. 7 for 0007
        index: u32,
        #[command(flatten)]
        paths: PathArgs,
    },

    /// Show how the dataset splits across shards
    Shards {
        /// Total number of shards
        #[arg(long, default_value_t = 1)]
        tot: usize,
        /// Root holding `<NNNN>/<NNNN>.obj` scans
        #[arg(long)]
        source: Option<PathBuf>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Create a bar that advances once per scan
fn create_progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            let head: String = value.chars().take(36).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Apply command-line path overrides on top of the loaded config.
fn apply_overrides(config: &mut NormalizerConfig, paths: PathArgs) {
    if let Some(source) = paths.source {
        config.dataset.source_root = source;
    }
    if let Some(dest) = paths.dest {
        config.dataset.dest_root = dest;
    }
    if let Some(params) = paths.params {
        config.dataset.params_root = params;
    }
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let mut config = match &cli.config {
        Some(path) => match NormalizerConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                NormalizerConfig::default()
            }
        },
        None => NormalizerConfig::default(),
    };

    // Dispatch to subcommands; a bare invocation runs a shard
    match cli.command.unwrap_or(Commands::Run(cli.run)) {
        Commands::Run(args) => {
            apply_overrides(&mut config, args.paths);
            cmd_run(args.id, args.tot, args.prune, &config);
        }
        Commands::Scan { index, paths } => {
            apply_overrides(&mut config, paths);
            cmd_scan(index, &config);
        }
        Commands::Shards { tot, source } => {
            let source = source.unwrap_or_else(|| config.dataset.source_root.clone());
            cmd_shards(tot, &source);
        }
    }
}

/// Discover the dataset and select this process's shard.
fn plan_shard(source_root: &Path, id: usize, tot: usize) -> anyhow::Result<(usize, Vec<u32>)> {
    let indices = sharding::discover_indices(source_root)
        .with_context(|| format!("Cannot enumerate scans in {}", source_root.display()))?;
    let selected = sharding::shard(&indices, id, tot).context("Invalid shard selection")?;
    Ok((indices.len(), selected.to_vec()))
}

fn cmd_run(id: usize, tot: usize, prune: bool, config: &NormalizerConfig) {
    let start = Instant::now();
    let layout = DatasetLayout::from(&config.dataset);

    let (total, indices) = match plan_shard(&layout.source_root, id, tot) {
        Ok(plan) => plan,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    println!("Normalizing shard {} of {}...", id, tot);
    println!("Source: {}", layout.source_root.display());
    println!("Destination: {}", layout.dest_root.display());
    println!("Parameters: {}", layout.params_root.display());
    println!("Scans in shard: {} of {}", indices.len(), total);

    let pb = create_progress_bar(indices.len() as u64);
    let result = normalize::normalize_shard(&layout, &indices, &config.export, |index, outcome| {
        pb.set_message(format!("{} {}", normalize::scan_id(index), outcome.label()));
        pb.inc(1);
    });
    pb.finish_and_clear();

    let report: BatchReport = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Normalization failed: {}", e);
            std::process::exit(1);
        }
    };

    let pruned = if prune {
        normalize::prune_empty_outputs(&layout, &indices)
    } else {
        0
    };

    let first_last = match (indices.first(), indices.last()) {
        (Some(first), Some(last)) => {
            format!("{} - {}", normalize::scan_id(*first), normalize::scan_id(*last))
        }
        _ => "none".to_string(),
    };

    print_summary(
        "Normalization Complete",
        &[
            ("Shard", format!("{} / {}", id, tot)),
            ("Index range", first_last),
            ("Normalized", report.normalized.to_string()),
            ("Unchanged", report.passed_through.to_string()),
            ("Missing scans", report.missing.to_string()),
            ("Load failures", report.failed.to_string()),
            ("Empty dirs removed", pruned.to_string()),
            ("Vertices written", report.vertices.to_string()),
            ("Output directory", layout.dest_root.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_scan(index: u32, config: &NormalizerConfig) {
    let start = Instant::now();
    let layout = DatasetLayout::from(&config.dataset);

    println!("Normalizing scan {}...", normalize::scan_id(index));
    println!("Input: {}", layout.scan_path(index).display());

    let spinner = create_spinner("Aligning vertices...");

    match normalize::process_scan(&layout, index, &config.export) {
        Ok(outcome) => {
            spinner.finish_and_clear();

            let mut items = vec![
                ("Scan", normalize::scan_id(index)),
                ("Outcome", outcome.label().to_string()),
            ];
            match &outcome {
                ScanOutcome::Normalized {
                    vertices,
                    faces,
                    params,
                } => {
                    items.push(("Vertices", vertices.to_string()));
                    items.push(("Faces", faces.to_string()));
                    items.push(("Translation", format!("{:?}", params.translation)));
                    items.push(("Scale", params.scale.to_string()));
                }
                ScanOutcome::PassThrough { vertices, faces } => {
                    items.push(("Vertices", vertices.to_string()));
                    items.push(("Faces", faces.to_string()));
                }
                ScanOutcome::LoadFailed { reason } => {
                    items.push(("Reason", reason.clone()));
                }
                ScanOutcome::MissingScan => {}
            }
            if outcome.exported() {
                items.push(("Output file", layout.output_path(index).display().to_string()));
            }
            items.push(("Duration", format!("{:.2?}", start.elapsed())));

            print_summary("Scan Complete", &items);
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Normalization failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_shards(tot: usize, source_root: &Path) {
    if tot == 0 {
        error!("Shard count must be at least 1");
        std::process::exit(1);
    }

    let indices = match sharding::discover_indices(source_root) {
        Ok(indices) => indices,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let labels: Vec<String> = (0..tot).map(|i| format!("Shard {}", i)).collect();
    let mut items = vec![
        ("Source", source_root.display().to_string()),
        ("Scans", indices.len().to_string()),
    ];
    for (label, part) in labels.iter().zip(sharding::split(&indices, tot)) {
        let range = match (part.first(), part.last()) {
            (Some(first), Some(last)) => format!(
                "{} scans, {} - {}",
                part.len(),
                normalize::scan_id(*first),
                normalize::scan_id(*last)
            ),
            _ => "0 scans".to_string(),
        };
        items.push((label.as_str(), range));
    }

    print_summary("Shard Plan", &items);
}
