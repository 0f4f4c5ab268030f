//! Scan normalization.
//!
//! A scan `<source_root>/<NNNN>/<NNNN>.obj` is translated and rescaled
//! with the alignment parameters in `<params_root>/<NNNN>_smpl.pkl` and
//! written to `<dest_root>/<NNNN>/<NNNN>.obj`. When no parameters exist
//! the mesh is written unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use thiserror::Error;

use super::params::{params_path, AlignmentParams, ParamsError};
use crate::config::{DatasetConfig, ExportConfig};
use crate::core::loaders::load_obj;
use crate::core::transforms::{normalize_vertices, vertex_bounds};
use crate::core::writers::{copy_materials, write_obj, WriteError};

/// Errors that abort a normalization run.
///
/// Missing scans and unreadable meshes are not errors; they are reported
/// as [`ScanOutcome`] variants instead.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid alignment parameters for scan {id}: {source}")]
    Params {
        id: String,
        #[source]
        source: ParamsError,
    },

    #[error("Failed to export scan {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: WriteError,
    },
}

/// Result type for normalization operations.
pub type Result<T> = std::result::Result<T, NormalizeError>;

/// What happened to a single scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Vertices were aligned and the mesh exported.
    Normalized {
        vertices: usize,
        faces: usize,
        params: AlignmentParams,
    },
    /// No parameter file; the mesh was exported unchanged.
    PassThrough { vertices: usize, faces: usize },
    /// The scan mesh does not exist. Nothing was written.
    MissingScan,
    /// The scan mesh exists but could not be parsed.
    LoadFailed { reason: String },
}

impl ScanOutcome {
    /// True when an output mesh was written.
    pub fn exported(&self) -> bool {
        matches!(self, Self::Normalized { .. } | Self::PassThrough { .. })
    }

    /// Short label for progress and summary output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Normalized { .. } => "normalized",
            Self::PassThrough { .. } => "pass-through",
            Self::MissingScan => "missing scan",
            Self::LoadFailed { .. } => "load failed",
        }
    }
}

/// Zero-padded scan identifier: `7` becomes `"0007"`.
pub fn scan_id(index: u32) -> String {
    format!("{:04}", index)
}

/// Resolved input and output locations for a dataset.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    pub params_root: PathBuf,
}

impl DatasetLayout {
    pub fn new(
        source_root: impl Into<PathBuf>,
        dest_root: impl Into<PathBuf>,
        params_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            dest_root: dest_root.into(),
            params_root: params_root.into(),
        }
    }

    /// `<source_root>/<NNNN>/<NNNN>.obj`
    pub fn scan_path(&self, index: u32) -> PathBuf {
        let id = scan_id(index);
        self.source_root.join(&id).join(format!("{}.obj", id))
    }

    /// `<dest_root>/<NNNN>`
    pub fn output_dir(&self, index: u32) -> PathBuf {
        self.dest_root.join(scan_id(index))
    }

    /// `<dest_root>/<NNNN>/<NNNN>.obj`
    pub fn output_path(&self, index: u32) -> PathBuf {
        self.output_dir(index).join(format!("{}.obj", scan_id(index)))
    }

    /// `<params_root>/<NNNN>_smpl.pkl`
    pub fn params_path(&self, index: u32) -> PathBuf {
        params_path(&self.params_root, index)
    }
}

impl From<&DatasetConfig> for DatasetLayout {
    fn from(config: &DatasetConfig) -> Self {
        Self::new(&config.source_root, &config.dest_root, &config.params_root)
    }
}

/// Normalize and export one scan.
///
/// # Errors
///
/// Returns an error when the parameter file exists but is malformed, or
/// when the output cannot be written. Both abort the whole run.
pub fn process_scan(layout: &DatasetLayout, index: u32, export: &ExportConfig) -> Result<ScanOutcome> {
    let id = scan_id(index);
    let scan_path = layout.scan_path(index);
    debug!("Trying to load {}", scan_path.display());

    if !scan_path.is_file() {
        warn!("Scan {} not found at {}, skipping", id, scan_path.display());
        return Ok(ScanOutcome::MissingScan);
    }

    let out_dir = layout.output_dir(index);
    fs::create_dir_all(&out_dir).map_err(|e| NormalizeError::CreateDir {
        path: out_dir.clone(),
        source: e,
    })?;

    let mut mesh = match load_obj(&scan_path) {
        Ok(mesh) => mesh,
        Err(e) => {
            error!("Failed to load scan {}: {}", id, e);
            return Ok(ScanOutcome::LoadFailed {
                reason: e.to_string(),
            });
        }
    };

    let params_file = layout.params_path(index);
    let params = if params_file.is_file() {
        let params = AlignmentParams::from_pickle(&params_file).map_err(|e| NormalizeError::Params {
            id: id.clone(),
            source: e,
        })?;
        normalize_vertices(&mut mesh.vertices, params.translation, params.scale);
        debug!(
            "Scan {}: t = {:?}, s = {}",
            id, params.translation, params.scale
        );
        if log::log_enabled!(log::Level::Debug) {
            if let Some((lo, hi)) = vertex_bounds(&mesh.vertices) {
                debug!("Scan {}: aligned bounds {:?} to {:?}", id, lo, hi);
            }
        }
        Some(params)
    } else {
        info!(
            "No parameters for scan {} at {}, exporting unchanged",
            id,
            params_file.display()
        );
        None
    };

    let out_path = layout.output_path(index);
    write_obj(&out_path, &mesh, export.precision).map_err(|e| NormalizeError::Write {
        id: id.clone(),
        source: e,
    })?;

    if export.copy_materials {
        if let Some(src_dir) = scan_path.parent() {
            copy_materials(&mesh, src_dir, &out_dir).map_err(|e| NormalizeError::Write {
                id: id.clone(),
                source: e,
            })?;
        }
    }

    let vertices = mesh.vertex_count();
    let faces = mesh.face_count();
    Ok(match params {
        Some(params) => ScanOutcome::Normalized {
            vertices,
            faces,
            params,
        },
        None => ScanOutcome::PassThrough { vertices, faces },
    })
}

/// Tally of outcomes over a batch of scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub normalized: usize,
    pub passed_through: usize,
    pub missing: usize,
    pub failed: usize,
    pub vertices: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: &ScanOutcome) {
        match outcome {
            ScanOutcome::Normalized { vertices, .. } => {
                self.normalized += 1;
                self.vertices += vertices;
            }
            ScanOutcome::PassThrough { vertices, .. } => {
                self.passed_through += 1;
                self.vertices += vertices;
            }
            ScanOutcome::MissingScan => self.missing += 1,
            ScanOutcome::LoadFailed { .. } => self.failed += 1,
        }
    }

    /// Number of scans that produced an output mesh.
    pub fn exported(&self) -> usize {
        self.normalized + self.passed_through
    }

    /// Number of scans visited.
    pub fn total(&self) -> usize {
        self.exported() + self.missing + self.failed
    }
}

/// Run [`process_scan`] over `indices` in order.
///
/// `on_progress` is called after each scan completes. The first fatal
/// error stops the batch.
pub fn normalize_shard<F>(
    layout: &DatasetLayout,
    indices: &[u32],
    export: &ExportConfig,
    mut on_progress: F,
) -> Result<BatchReport>
where
    F: FnMut(u32, &ScanOutcome),
{
    let mut report = BatchReport::default();

    for &index in indices {
        let outcome = process_scan(layout, index, export)?;
        report.record(&outcome);
        on_progress(index, &outcome);
    }

    info!(
        "Processed {} scans: {} normalized, {} unchanged, {} missing, {} failed",
        report.total(),
        report.normalized,
        report.passed_through,
        report.missing,
        report.failed
    );

    Ok(report)
}

/// True when `path` exists as a directory with no entries.
fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Remove output directories left empty by scans that failed to load.
///
/// Returns the number of directories removed.
pub fn prune_empty_outputs(layout: &DatasetLayout, indices: &[u32]) -> usize {
    indices
        .iter()
        .map(|&index| layout.output_dir(index))
        .filter(|dir| is_empty_dir(dir))
        .filter(|dir| match fs::remove_dir(dir) {
            Ok(()) => {
                debug!("Removed empty output directory {}", dir.display());
                true
            }
            Err(e) => {
                warn!("Could not remove {}: {}", dir.display(), e);
                false
            }
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::load_obj;
    use crate::core::pickle::fixtures::smpl_record;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        layout: DatasetLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let layout = DatasetLayout::new(
                temp.path().join("release"),
                temp.path().join("aligned"),
                temp.path().join("smpl"),
            );
            fs::create_dir_all(&layout.source_root).unwrap();
            fs::create_dir_all(&layout.params_root).unwrap();
            Self { _temp: temp, layout }
        }

        fn add_scan(&self, index: u32, content: &str) {
            let path = self.layout.scan_path(index);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn add_params(&self, index: u32, transl: [f32; 3], scale: f32) {
            fs::write(self.layout.params_path(index), smpl_record(transl, scale)).unwrap();
        }
    }

    const TWO_VERTS: &str = "v 1 1 1\nv 2 2 2\nv 0 0 0\nf 1 2 3\n";

    fn plain_export() -> ExportConfig {
        ExportConfig {
            precision: None,
            copy_materials: true,
        }
    }

    #[test]
    fn test_scan_id() {
        assert_eq!(scan_id(7), "0007");
        assert_eq!(scan_id(0), "0000");
        assert_eq!(scan_id(525), "0525");
        assert_eq!(scan_id(12345), "12345");
    }

    #[test]
    fn test_layout_paths() {
        let layout = DatasetLayout::new("src", "dst", "params");
        assert_eq!(layout.scan_path(3), PathBuf::from("src/0003/0003.obj"));
        assert_eq!(layout.output_path(3), PathBuf::from("dst/0003/0003.obj"));
        assert_eq!(layout.params_path(3), PathBuf::from("params/0003_smpl.pkl"));
    }

    #[test]
    fn test_normalizes_scan() {
        let fx = Fixture::new();
        fx.add_scan(3, TWO_VERTS);
        fx.add_params(3, [1.0, 0.0, 0.0], 2.0);

        let outcome = process_scan(&fx.layout, 3, &plain_export()).unwrap();
        assert!(matches!(
            outcome,
            ScanOutcome::Normalized {
                vertices: 3,
                faces: 1,
                ..
            }
        ));

        let out = load_obj(fx.layout.output_path(3)).unwrap();
        assert_eq!(out.vertices[0], [0.0, 0.5, 0.5]);
        assert_eq!(out.vertices[1], [0.5, 1.0, 1.0]);
        assert_eq!(out.vertices[2], [-0.5, 0.0, 0.0]);
        assert_eq!(out.face_count(), 1);
    }

    #[test]
    fn test_two_vertex_scan() {
        let fx = Fixture::new();
        fx.add_scan(3, "v 1 1 1\nv 2 2 2\n");
        fx.add_params(3, [1.0, 0.0, 0.0], 2.0);

        let outcome = process_scan(&fx.layout, 3, &plain_export()).unwrap();
        assert!(matches!(
            outcome,
            ScanOutcome::Normalized {
                vertices: 2,
                faces: 0,
                ..
            }
        ));

        let out = load_obj(fx.layout.output_path(3)).unwrap();
        assert_eq!(out.vertices, vec![[0.0, 0.5, 0.5], [0.5, 1.0, 1.0]]);
        assert_eq!(
            fs::read_to_string(fx.layout.output_path(3)).unwrap(),
            "v 0 0.5 0.5\nv 0.5 1 1\n"
        );
    }

    #[test]
    fn test_pass_through_without_params() {
        let fx = Fixture::new();
        let content = "mtllib material0.mtl\nv 0.1 -2.5 3e-4\nv 1 2 3\nv 4 5 6\nvt 0 1\nf 1/1 2/1 3/1\n";
        fx.add_scan(8, content);

        let outcome = process_scan(&fx.layout, 8, &plain_export()).unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::PassThrough {
                vertices: 3,
                faces: 1
            }
        );

        let original = load_obj(fx.layout.scan_path(8)).unwrap();
        let out = load_obj(fx.layout.output_path(8)).unwrap();
        assert_eq!(out.vertices, original.vertices);
        assert_eq!(out.lines(), original.lines());
    }

    #[test]
    fn test_missing_scan_writes_nothing() {
        let fx = Fixture::new();
        fx.add_params(4, [0.0, 0.0, 0.0], 1.0);

        let outcome = process_scan(&fx.layout, 4, &plain_export()).unwrap();
        assert_eq!(outcome, ScanOutcome::MissingScan);
        assert!(!fx.layout.output_dir(4).exists());
    }

    #[test]
    fn test_load_failure_leaves_empty_dir() {
        let fx = Fixture::new();
        fx.add_scan(5, "");

        let outcome = process_scan(&fx.layout, 5, &plain_export()).unwrap();
        assert!(matches!(outcome, ScanOutcome::LoadFailed { .. }));
        assert!(fx.layout.output_dir(5).is_dir());
        assert!(!fx.layout.output_path(5).exists());

        assert_eq!(prune_empty_outputs(&fx.layout, &[5]), 1);
        assert!(!fx.layout.output_dir(5).exists());
    }

    #[test]
    fn test_malformed_params_abort() {
        let fx = Fixture::new();
        fx.add_scan(6, TWO_VERTS);
        fs::write(fx.layout.params_path(6), b"\x80\x04garbage").unwrap();

        let result = process_scan(&fx.layout, 6, &plain_export());
        assert!(matches!(result, Err(NormalizeError::Params { .. })));
    }

    #[test]
    fn test_idempotent_output() {
        let fx = Fixture::new();
        fx.add_scan(9, TWO_VERTS);
        fx.add_params(9, [0.25, -1.5, 3.0], 0.9);

        process_scan(&fx.layout, 9, &plain_export()).unwrap();
        let first = fs::read(fx.layout.output_path(9)).unwrap();
        process_scan(&fx.layout, 9, &plain_export()).unwrap();
        let second = fs::read(fx.layout.output_path(9)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_copies_materials() {
        let fx = Fixture::new();
        fx.add_scan(2, "mtllib material0.mtl\nv 1 2 3\nv 1 2 4\nv 2 2 3\nf 1 2 3\n");
        let src_dir = fx.layout.scan_path(2).parent().unwrap().to_path_buf();
        fs::write(src_dir.join("material0.mtl"), "newmtl m\nmap_Kd material0.jpeg\n").unwrap();
        fs::write(src_dir.join("material0.jpeg"), [1u8, 2, 3]).unwrap();

        process_scan(&fx.layout, 2, &plain_export()).unwrap();
        assert!(fx.layout.output_dir(2).join("material0.mtl").is_file());
        assert!(fx.layout.output_dir(2).join("material0.jpeg").is_file());

        let no_copy = ExportConfig {
            precision: None,
            copy_materials: false,
        };
        let other = DatasetLayout::new(
            &fx.layout.source_root,
            fx.layout.dest_root.join("bare"),
            &fx.layout.params_root,
        );
        process_scan(&other, 2, &no_copy).unwrap();
        assert!(other.output_path(2).is_file());
        assert!(!other.output_dir(2).join("material0.mtl").exists());
    }

    #[test]
    fn test_normalize_shard_tallies() {
        let fx = Fixture::new();
        fx.add_scan(0, TWO_VERTS);
        fx.add_params(0, [0.0, 0.0, 0.0], 2.0);
        fx.add_scan(1, TWO_VERTS);
        fx.add_scan(3, "# nothing here\n");

        let mut seen = Vec::new();
        let report = normalize_shard(&fx.layout, &[0, 1, 2, 3], &plain_export(), |idx, outcome| {
            seen.push((idx, outcome.label()));
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![
                (0, "normalized"),
                (1, "pass-through"),
                (2, "missing scan"),
                (3, "load failed"),
            ]
        );
        assert_eq!(
            report,
            BatchReport {
                normalized: 1,
                passed_through: 1,
                missing: 1,
                failed: 1,
                vertices: 6,
            }
        );
        assert_eq!(report.exported(), 2);
        assert_eq!(report.total(), 4);
    }

    #[test]
    fn test_normalize_shard_stops_on_fatal_error() {
        let fx = Fixture::new();
        fx.add_scan(0, TWO_VERTS);
        fs::write(fx.layout.params_path(0), b"junk").unwrap();
        fx.add_scan(1, TWO_VERTS);

        let mut visited = 0;
        let result = normalize_shard(&fx.layout, &[0, 1], &plain_export(), |_, _| visited += 1);

        assert!(result.is_err());
        assert_eq!(visited, 0);
        assert!(!fx.layout.output_path(1).exists());
    }
}
