//! Alignment parameters read from fitted body-model records.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::pickle::{self, PickleError, Value};

/// Errors that can occur while reading alignment parameters.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: PickleError,
    },

    #[error("Parameter record is a {0}, expected a dict")]
    NotADict(&'static str),

    #[error("Parameter record has no '{0}' field")]
    MissingField(&'static str),

    #[error("Field '{field}' is not numeric: {source}")]
    NotNumeric {
        field: &'static str,
        #[source]
        source: PickleError,
    },

    #[error("Translation must have 3 components, found {0}")]
    BadTranslation(usize),

    #[error("Scale field is empty")]
    EmptyScale,

    #[error("Translation {0:?} is not finite")]
    NonFiniteTranslation([f64; 3]),

    #[error("Scale {0} must be finite and positive")]
    BadScale(f64),
}

/// Result type for parameter operations.
pub type Result<T> = std::result::Result<T, ParamsError>;

/// Translation and uniform scale that map a scan into body-model space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentParams {
    /// Subtracted from every vertex.
    pub translation: [f64; 3],
    /// Every translated vertex is divided by this.
    pub scale: f64,
}

fn numeric_field(record: &Value, field: &'static str) -> Result<Vec<f64>> {
    record
        .get(field)
        .ok_or(ParamsError::MissingField(field))?
        .to_f64_vec()
        .map_err(|source| ParamsError::NotNumeric { field, source })
}

impl AlignmentParams {
    /// Extract `transl` and `scale` from a decoded record.
    ///
    /// `transl` must flatten to exactly three numbers (shape `(3,)` or
    /// `(1, 3)`). Only the first element of `scale` is used.
    pub fn from_value(record: &Value) -> Result<Self> {
        if !matches!(record, Value::Dict(_)) {
            return Err(ParamsError::NotADict(record.type_name()));
        }

        let transl = numeric_field(record, "transl")?;
        if transl.len() != 3 {
            return Err(ParamsError::BadTranslation(transl.len()));
        }
        let translation = [transl[0], transl[1], transl[2]];
        if translation.iter().any(|t| !t.is_finite()) {
            return Err(ParamsError::NonFiniteTranslation(translation));
        }

        let scale = numeric_field(record, "scale")?
            .first()
            .copied()
            .ok_or(ParamsError::EmptyScale)?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ParamsError::BadScale(scale));
        }

        Ok(Self { translation, scale })
    }

    /// Read a pickled parameter record from disk.
    pub fn from_pickle<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let record = pickle::from_file(path).map_err(|source| ParamsError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(&record)
    }
}

/// Location of the parameter file for a scan: `<root>/<NNNN>_smpl.pkl`.
pub fn params_path(params_root: &Path, index: u32) -> PathBuf {
    params_root.join(format!("{:04}_smpl.pkl", index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pickle::fixtures::{smpl_record, smpl_record_protocol5};
    use tempfile::TempDir;

    fn record(fields: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Str(k.to_string()), v))
                .collect(),
        )
    }

    #[test]
    fn test_params_path() {
        assert_eq!(
            params_path(Path::new("smpl"), 7),
            PathBuf::from("smpl/0007_smpl.pkl")
        );
        assert_eq!(
            params_path(Path::new("smpl"), 12345),
            PathBuf::from("smpl/12345_smpl.pkl")
        );
    }

    #[test]
    fn test_from_pickle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0003_smpl.pkl");
        std::fs::write(&path, smpl_record([1.0, 0.0, 0.0], 2.0)).unwrap();

        let params = AlignmentParams::from_pickle(&path).unwrap();
        assert_eq!(params.translation, [1.0, 0.0, 0.0]);
        assert_eq!(params.scale, 2.0);
    }

    #[test]
    fn test_from_pickle_protocol5() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0003_smpl.pkl");
        std::fs::write(
            &path,
            smpl_record_protocol5([1.0, 0.0, 0.0], 2.0, "numpy._core.numeric"),
        )
        .unwrap();

        let params = AlignmentParams::from_pickle(&path).unwrap();
        assert_eq!(params.translation, [1.0, 0.0, 0.0]);
        assert_eq!(params.scale, 2.0);
    }

    #[test]
    fn test_from_pickle_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0003_smpl.pkl");
        std::fs::write(&path, b"not a pickle").unwrap();

        assert!(matches!(
            AlignmentParams::from_pickle(&path),
            Err(ParamsError::Decode { .. })
        ));
    }

    #[test]
    fn test_scale_uses_first_element() {
        let value = record(vec![
            (
                "transl",
                Value::List(vec![Value::Float(0.5), Value::Int(1), Value::Float(-2.0)]),
            ),
            ("scale", Value::List(vec![Value::Float(0.8), Value::Float(5.0)])),
        ]);

        let params = AlignmentParams::from_value(&value).unwrap();
        assert_eq!(params.translation, [0.5, 1.0, -2.0]);
        assert_eq!(params.scale, 0.8);
    }

    #[test]
    fn test_missing_fields() {
        let value = record(vec![("scale", Value::Float(1.0))]);
        assert!(matches!(
            AlignmentParams::from_value(&value),
            Err(ParamsError::MissingField("transl"))
        ));

        let value = record(vec![(
            "transl",
            Value::Tuple(vec![Value::Int(0), Value::Int(0), Value::Int(0)]),
        )]);
        assert!(matches!(
            AlignmentParams::from_value(&value),
            Err(ParamsError::MissingField("scale"))
        ));
    }

    #[test]
    fn test_bad_translation_length() {
        let value = record(vec![
            ("transl", Value::List(vec![Value::Float(1.0), Value::Float(2.0)])),
            ("scale", Value::Float(1.0)),
        ]);
        assert!(matches!(
            AlignmentParams::from_value(&value),
            Err(ParamsError::BadTranslation(2))
        ));
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let value = record(vec![
                (
                    "transl",
                    Value::List(vec![Value::Int(0), Value::Int(0), Value::Int(0)]),
                ),
                ("scale", Value::List(vec![Value::Float(bad)])),
            ]);
            assert!(matches!(
                AlignmentParams::from_value(&value),
                Err(ParamsError::BadScale(_))
            ));
        }
    }

    #[test]
    fn test_empty_scale() {
        let value = record(vec![
            (
                "transl",
                Value::List(vec![Value::Int(0), Value::Int(0), Value::Int(0)]),
            ),
            ("scale", Value::List(Vec::new())),
        ]);
        assert!(matches!(
            AlignmentParams::from_value(&value),
            Err(ParamsError::EmptyScale)
        ));
    }

    #[test]
    fn test_not_a_dict() {
        assert!(matches!(
            AlignmentParams::from_value(&Value::List(Vec::new())),
            Err(ParamsError::NotADict("list"))
        ));
    }

    #[test]
    fn test_non_numeric_field() {
        let value = record(vec![
            ("transl", Value::Str("oops".to_string())),
            ("scale", Value::Float(1.0)),
        ]);
        assert!(matches!(
            AlignmentParams::from_value(&value),
            Err(ParamsError::NotNumeric { field: "transl", .. })
        ));
    }
}
