//! Static partitioning of scan indices across independent invocations.
//!
//! Each invocation is given a shard id and a shard count and processes one
//! contiguous slice of the sorted index list. Shards never overlap, and
//! running every id once covers every index exactly once.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

/// Errors that can occur while planning shards.
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("Shard count must be at least 1")]
    ZeroShards,

    #[error("Shard id {id} out of range for {count} shards")]
    IdOutOfRange { id: usize, count: usize },

    #[error("Failed to list {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for sharding operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Split `items` into `n` contiguous, near-equal slices.
///
/// Slice lengths differ by at most one; the first `len % n` slices take
/// the extra element. Some slices are empty when `n > len`.
///
/// Boundaries depend on `items.len()`. With [`discover_indices`] that is the
/// number of distinct indices, so a dataset holding both `7` and `0007`
/// counts one scan there, not two.
///
/// # Panics
///
/// Panics if `n` is zero. Use [`shard`] for a checked variant.
pub fn split<T>(items: &[T], n: usize) -> Vec<&[T]> {
    assert!(n > 0, "cannot split into zero shards");
    let k = items.len() / n;
    let m = items.len() % n;

    (0..n)
        .map(|i| &items[i * k + i.min(m)..(i + 1) * k + (i + 1).min(m)])
        .collect()
}

/// Select shard `id` of `count` from `items`.
pub fn shard<T>(items: &[T], id: usize, count: usize) -> Result<&[T]> {
    if count == 0 {
        return Err(ShardError::ZeroShards);
    }
    if id >= count {
        return Err(ShardError::IdOutOfRange { id, count });
    }
    Ok(split(items, count)[id])
}

/// List the scan indices under `source_root`, ascending.
///
/// Only entries whose names are made entirely of ASCII digits count.
/// Names that denote the same number (`7`, `0007`) are reported once.
pub fn discover_indices(source_root: &Path) -> Result<Vec<u32>> {
    let entries = fs::read_dir(source_root).map_err(|e| ShardError::ListDir {
        path: source_root.to_path_buf(),
        source: e,
    })?;

    let mut indices: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            match name.parse::<u32>() {
                Ok(idx) => Some(idx),
                Err(_) => {
                    debug!("Skipping entry {}: index out of range", name);
                    None
                }
            }
        })
        .collect();

    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}
