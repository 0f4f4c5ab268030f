//! Data writers for aligned meshes.
//!
//! This module provides:
//! - An OBJ writer that replays the source file's lines with updated vertices
//! - A copier for the material libraries and textures a mesh references

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use super::loaders::{load_mtl_textures, ObjLine, ObjMesh};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to copy a material or texture file.
    #[error("failed to copy '{from}' to '{to}': {source}")]
    CopyFile {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

fn format_coord(value: f64, precision: Option<usize>) -> String {
    match precision {
        Some(p) => format!("{:.*}", p, value),
        None => format!("{}", value),
    }
}

/// Write a mesh to a Wavefront OBJ file.
///
/// Lines are written in the order they were read. `v` statements take
/// their coordinates from `mesh.vertices` and keep any trailing tokens;
/// every other line is written unchanged.
///
/// # Arguments
///
/// * `path` - Output file path (parent directories will be created if needed)
/// * `mesh` - Mesh to write
/// * `precision` - Fixed decimals for coordinates, or `None` for the
///   shortest representation that parses back to the same `f64`
///
/// # Errors
///
/// Returns an error if:
/// - Parent directories cannot be created
/// - File cannot be created or written to
pub fn write_obj(path: &Path, mesh: &ObjMesh, precision: Option<usize>) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();

    for line in mesh.lines() {
        let written = match line {
            ObjLine::Vertex { index, extra } => {
                let [x, y, z] = mesh.vertices[*index];
                let coords = format!(
                    "v {} {} {}",
                    format_coord(x, precision),
                    format_coord(y, precision),
                    format_coord(z, precision)
                );
                if extra.is_empty() {
                    writeln!(writer, "{}", coords)
                } else {
                    writeln!(writer, "{} {}", coords, extra)
                }
            }
            ObjLine::Other(text) => writeln!(writer, "{}", text),
        };

        written.map_err(|e| WriteError::WriteFile {
            path: path_str.clone(),
            source: e,
        })?;
    }

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// True when `name` stays below the directory it is joined to.
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_sibling(src_dir: &Path, dst_dir: &Path, name: &str) -> Result<Option<PathBuf>> {
    if !is_contained(name) {
        warn!("Referenced file {} is outside the scan directory, not copied", name);
        return Ok(None);
    }

    let from = src_dir.join(name);
    if !from.is_file() {
        warn!("Referenced file {} not found, not copied", from.display());
        return Ok(None);
    }

    let to = dst_dir.join(name);
    if same_file(&from, &to) {
        debug!("{} is already in place", to.display());
        return Ok(None);
    }
    ensure_parent_dirs(&to)?;
    fs::copy(&from, &to).map_err(|e| WriteError::CopyFile {
        from: from.display().to_string(),
        to: to.display().to_string(),
        source: e,
    })?;
    debug!("Copied {} -> {}", from.display(), to.display());

    Ok(Some(to))
}

/// Copy the material libraries a mesh references, and their textures.
///
/// Names are resolved relative to `src_dir` and recreated under `dst_dir`.
/// Absolute names and names that climb out with `..` are never copied, so
/// nothing is written outside `dst_dir`. Missing files are logged and
/// skipped. Nothing is copied when both
/// directories are the same.
///
/// # Returns
///
/// Paths of the files written under `dst_dir`.
pub fn copy_materials(mesh: &ObjMesh, src_dir: &Path, dst_dir: &Path) -> Result<Vec<PathBuf>> {
    if same_file(src_dir, dst_dir) {
        return Ok(Vec::new());
    }

    let mut copied = Vec::new();

    for lib in mesh.material_libs() {
        let Some(dest) = copy_sibling(src_dir, dst_dir, lib)? else {
            continue;
        };
        copied.push(dest);

        let lib_path = src_dir.join(lib);
        let lib_dir = lib_path.parent().unwrap_or(src_dir);
        let textures = match load_mtl_textures(&lib_path) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not read material library {}: {}", lib_path.display(), e);
                continue;
            }
        };

        let dst_lib_dir = dst_dir.join(lib);
        let dst_lib_dir = dst_lib_dir.parent().unwrap_or(dst_dir);
        for texture in textures {
            if let Some(dest) = copy_sibling(lib_dir, dst_lib_dir, &texture)? {
                copied.push(dest);
            }
        }
    }

    Ok(copied)
}
