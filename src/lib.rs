//! Alignment of THuman2.0 scans to their fitted SMPL parameters.
//!
//! This crate provides tools for:
//! - Loading and re-exporting Wavefront OBJ scans with textures intact
//! - Reading pickled SMPL parameter records (numpy arrays included)
//! - Applying the `v' = (v - t) / s` alignment to every vertex
//! - Splitting the dataset into shards for independent workers
//!
//! # Example
//!
//! ```no_run
//! use scan_normalizer::processors::{normalize_shard, DatasetLayout};
//! use scan_normalizer::{ExportConfig, NormalizerConfig};
//!
//! let config = NormalizerConfig::default();
//! let layout = DatasetLayout::from(&config.dataset);
//! let report = normalize_shard(&layout, &[0, 1, 2], &ExportConfig::default(), |_, _| {}).unwrap();
//! println!("{} scans exported", report.exported());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use config::{DatasetConfig, ExportConfig, NormalizerConfig};
pub use core::loaders::ObjMesh;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
