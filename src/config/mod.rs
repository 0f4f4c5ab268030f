//! Configuration types for the scan normalizer.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where scans, fitted parameters and aligned output live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Root holding `<index>/<index>.obj` scan folders
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Root that receives `<index>/<index>.obj` aligned meshes
    #[serde(default = "default_dest_root")]
    pub dest_root: PathBuf,

    /// Directory holding `<index>_smpl.pkl` parameter files
    #[serde(default = "default_params_root")]
    pub params_root: PathBuf,
}

fn default_source_root() -> PathBuf {
    PathBuf::from("datasets/THuman2.0/THuman2.0_Release")
}

fn default_dest_root() -> PathBuf {
    PathBuf::from("datasets/THuman2.0/THuman2.0_aligned_scans")
}

fn default_params_root() -> PathBuf {
    PathBuf::from("datasets/THuman2.0/THuman2.0_smpl")
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            source_root: default_source_root(),
            dest_root: default_dest_root(),
            params_root: default_params_root(),
        }
    }
}

/// Controls how aligned meshes are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Fixed number of decimals for vertex coordinates.
    /// `None` writes the shortest representation that round-trips.
    #[serde(default)]
    pub precision: Option<usize>,

    /// Copy material libraries and textures next to the exported mesh
    #[serde(default = "default_copy_materials")]
    pub copy_materials: bool,
}

fn default_copy_materials() -> bool {
    true
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            precision: None,
            copy_materials: default_copy_materials(),
        }
    }
}

/// Top-level configuration combining all sub-configs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

impl NormalizerConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: NormalizerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_dataset_config() {
        let config = DatasetConfig::default();
        assert_eq!(
            config.source_root,
            PathBuf::from("datasets/THuman2.0/THuman2.0_Release")
        );
        assert_eq!(
            config.params_root,
            PathBuf::from("datasets/THuman2.0/THuman2.0_smpl")
        );
    }

    #[test]
    fn test_default_export_config() {
        let config = ExportConfig::default();
        assert_eq!(config.precision, None);
        assert!(config.copy_materials);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "export:\n  precision: 6\n").unwrap();

        let config = NormalizerConfig::from_yaml(&path).unwrap();
        assert_eq!(config.export.precision, Some(6));
        assert!(config.export.copy_materials);
        assert_eq!(config.dataset, DatasetConfig::default());
    }

    #[test]
    fn test_yaml_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");

        let mut config = NormalizerConfig::default();
        config.dataset.dest_root = PathBuf::from("/tmp/aligned");
        config.export.copy_materials = false;
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let reloaded = NormalizerConfig::from_yaml(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
