//! Dataset processing: parameter records, scan normalization and sharding.

pub mod normalize;
pub mod params;
pub mod sharding;

// Re-export key types for convenience
pub use normalize::{
    normalize_shard, process_scan, scan_id, BatchReport, DatasetLayout, NormalizeError,
    ScanOutcome,
};
pub use params::{params_path, AlignmentParams, ParamsError};
pub use sharding::{discover_indices, shard, split, ShardError};
