//! Data loaders for Wavefront OBJ meshes and their material libraries.
//!
//! The OBJ reader only interprets what alignment needs: vertex positions are
//! parsed into `f64` triples, faces are validated against the vertex list,
//! and `mtllib` statements are collected. Every other line is kept verbatim
//! and in order so the exported mesh carries the same topology, UVs and
//! material bindings as the scan it came from.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mesh has no vertices: {0}")]
    EmptyFile(PathBuf),

    #[error("Invalid vertex on line {line}: {reason}")]
    InvalidVertex { line: usize, reason: String },

    #[error("Invalid face on line {line}: {reason}")]
    InvalidFace { line: usize, reason: String },
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// One line of an OBJ file as it will be written back out.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjLine {
    /// A `v` statement. `extra` holds any tokens after x, y, z
    /// (per-vertex colours or a `w` weight), space-joined.
    Vertex { index: usize, extra: String },
    /// Anything else, kept byte-for-byte.
    Other(String),
}

/// A Wavefront OBJ mesh with editable vertex positions.
#[derive(Debug, Clone)]
pub struct ObjMesh {
    /// Vertex positions in file order.
    pub vertices: Vec<[f64; 3]>,
    lines: Vec<ObjLine>,
    face_count: usize,
    material_libs: Vec<String>,
}

impl ObjMesh {
    /// Returns the number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Returns the number of `f` statements.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.face_count
    }

    /// Material library file names referenced through `mtllib`.
    pub fn material_libs(&self) -> &[String] {
        &self.material_libs
    }

    /// Lines in file order, used by the writer.
    pub fn lines(&self) -> &[ObjLine] {
        &self.lines
    }
}

/// Parse and check one face corner's vertex reference.
///
/// OBJ references are 1-based, or negative and relative to the vertices
/// read so far. Negative references are checked against `seen` here;
/// positive ones are returned so the caller can check them once the whole
/// file has been read.
fn parse_vertex_ref(token: &str, seen: usize, line: usize) -> Result<i64> {
    let raw = token.split('/').next().unwrap_or("");
    let idx: i64 = raw.parse().map_err(|_| LoaderError::InvalidFace {
        line,
        reason: format!("bad vertex reference '{}'", token),
    })?;

    if idx == 0 {
        return Err(LoaderError::InvalidFace {
            line,
            reason: "vertex reference 0".to_string(),
        });
    }

    if idx < 0 && idx.unsigned_abs() as usize > seen {
        return Err(LoaderError::InvalidFace {
            line,
            reason: format!("relative reference {} before vertex {}", idx, seen),
        });
    }

    Ok(idx)
}

/// Load a mesh from a Wavefront OBJ file.
///
/// # Errors
///
/// Fails on I/O errors, malformed `v` statements, faces with fewer than
/// three corners or with references outside the vertex list, and files
/// without any vertex.
pub fn load_obj<P: AsRef<Path>>(path: P) -> Result<ObjMesh> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut vertices: Vec<[f64; 3]> = Vec::with_capacity(1 << 16);
    let mut lines = Vec::with_capacity(1 << 17);
    let mut material_libs = Vec::new();
    let mut face_count = 0;
    // (line number, largest positive reference) for the deferred range check
    let mut max_ref: Option<(usize, usize)> = None;

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line?;
        let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
        let mut tokens = line.split_whitespace();

        match tokens.next() {
            Some("v") => {
                let mut coords = [0.0f64; 3];
                for (axis, coord) in coords.iter_mut().enumerate() {
                    let token = tokens.next().ok_or_else(|| LoaderError::InvalidVertex {
                        line: line_no,
                        reason: format!("expected 3 coordinates, found {}", axis),
                    })?;
                    *coord = token.parse().map_err(|_| LoaderError::InvalidVertex {
                        line: line_no,
                        reason: format!("bad coordinate '{}'", token),
                    })?;
                }

                let extra: Vec<&str> = tokens.collect();
                lines.push(ObjLine::Vertex {
                    index: vertices.len(),
                    extra: extra.join(" "),
                });
                vertices.push(coords);
            }
            Some("f") => {
                let corners: Vec<&str> = tokens.collect();
                if corners.len() < 3 {
                    return Err(LoaderError::InvalidFace {
                        line: line_no,
                        reason: format!("expected at least 3 corners, found {}", corners.len()),
                    });
                }

                for corner in corners {
                    let idx = parse_vertex_ref(corner, vertices.len(), line_no)?;
                    if idx > 0 && max_ref.map_or(true, |(_, m)| idx as usize > m) {
                        max_ref = Some((line_no, idx as usize));
                    }
                }

                face_count += 1;
                lines.push(ObjLine::Other(line));
            }
            Some("mtllib") => {
                material_libs.extend(tokens.map(str::to_string));
                lines.push(ObjLine::Other(line));
            }
            _ => lines.push(ObjLine::Other(line)),
        }
    }

    if vertices.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    if let Some((line, idx)) = max_ref {
        if idx > vertices.len() {
            return Err(LoaderError::InvalidFace {
                line,
                reason: format!(
                    "vertex reference {} out of range ({} vertices)",
                    idx,
                    vertices.len()
                ),
            });
        }
    }

    Ok(ObjMesh {
        vertices,
        lines,
        face_count,
        material_libs,
    })
}

/// Returns true for MTL statements whose last token names an image file.
fn is_texture_statement(keyword: &str) -> bool {
    keyword.starts_with("map_") || matches!(keyword, "bump" | "disp" | "decal" | "refl")
}

/// Collect the texture file names referenced by a material library.
///
/// Texture options such as `-s 1 1 1` precede the file name, so the last
/// token of each texture statement is taken. Duplicates are reported once,
/// in first-seen order.
pub fn load_mtl_textures<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut textures: Vec<String> = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if tokens.len() < 2 || !is_texture_statement(tokens[0]) {
            continue;
        }

        let name = tokens[tokens.len() - 1].to_string();
        if !textures.contains(&name) {
            textures.push(name);
        }
    }

    Ok(textures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn obj_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_obj_textured() -> Result<()> {
        let file = obj_file(
            "# scan\n\
             mtllib material0.mtl\n\
             usemtl material0\n\
             v 1.0 2.0 3.0\n\
             v 4.0 5.0 6.0\n\
             v 7.0 8.0 9.0\n\
             vt 0.1 0.2\n\
             vt 0.3 0.4\n\
             vt 0.5 0.6\n\
             f 1/1 2/2 3/3\n",
        );

        let mesh = load_obj(file.path())?;
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.face_count(), 1);
        assert_eq!(mesh.vertices[1], [4.0, 5.0, 6.0]);
        assert_eq!(mesh.material_libs(), &["material0.mtl".to_string()]);
        assert_eq!(mesh.lines().len(), 10);
        assert_eq!(mesh.lines()[0], ObjLine::Other("# scan".to_string()));

        Ok(())
    }

    #[test]
    fn test_load_obj_keeps_vertex_colors() -> Result<()> {
        let file = obj_file("v 1 2 3 0.5 0.25 1\nv 0 0 0\nv 1 1 1\nf 1 2 3\n");

        let mesh = load_obj(file.path())?;
        assert_eq!(
            mesh.lines()[0],
            ObjLine::Vertex {
                index: 0,
                extra: "0.5 0.25 1".to_string()
            }
        );
        assert_eq!(
            mesh.lines()[1],
            ObjLine::Vertex {
                index: 1,
                extra: String::new()
            }
        );

        Ok(())
    }

    #[test]
    fn test_load_obj_negative_references() -> Result<()> {
        let file = obj_file("v 0 0 0\nv 1 0 0\nv 0 1 0\nf -3 -2 -1\n");

        let mesh = load_obj(file.path())?;
        assert_eq!(mesh.face_count(), 1);

        Ok(())
    }

    #[test]
    fn test_load_obj_crlf() -> Result<()> {
        let file = obj_file("v 0 0 0\r\nv 1 0 0\r\nv 0 1 0\r\nf 1 2 3\r\n");

        let mesh = load_obj(file.path())?;
        assert_eq!(mesh.lines()[3], ObjLine::Other("f 1 2 3".to_string()));

        Ok(())
    }

    #[test]
    fn test_load_obj_bad_coordinate() {
        let file = obj_file("v 1.0 abc 3.0\n");

        match load_obj(file.path()) {
            Err(LoaderError::InvalidVertex { line, .. }) => assert_eq!(line, 1),
            other => panic!("Expected InvalidVertex, got {:?}", other),
        }
    }

    #[test]
    fn test_load_obj_short_vertex() {
        let file = obj_file("v 1.0 2.0\n");
        assert!(matches!(
            load_obj(file.path()),
            Err(LoaderError::InvalidVertex { .. })
        ));
    }

    #[test]
    fn test_load_obj_face_out_of_range() {
        let file = obj_file("v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 4\n");

        match load_obj(file.path()) {
            Err(LoaderError::InvalidFace { line, reason }) => {
                assert_eq!(line, 4);
                assert!(reason.contains("out of range"));
            }
            other => panic!("Expected InvalidFace, got {:?}", other),
        }
    }

    #[test]
    fn test_load_obj_degenerate_face() {
        let file = obj_file("v 0 0 0\nv 1 0 0\nf 1 2\n");
        assert!(matches!(
            load_obj(file.path()),
            Err(LoaderError::InvalidFace { .. })
        ));
    }

    #[test]
    fn test_load_obj_empty() {
        let file = obj_file("# nothing here\n");
        assert!(matches!(
            load_obj(file.path()),
            Err(LoaderError::EmptyFile(_))
        ));
    }

    #[test]
    fn test_load_obj_missing_file() {
        assert!(matches!(
            load_obj("/definitely/not/here.obj"),
            Err(LoaderError::Io(_))
        ));
    }

    #[test]
    fn test_load_mtl_textures() -> Result<()> {
        let file = obj_file(
            "newmtl material0\n\
             Ka 1 1 1\n\
             map_Kd material0.jpeg\n\
             map_Ks -s 1 1 1 spec.png\n\
             bump normal.png\n\
             map_Ka material0.jpeg\n",
        );

        let textures = load_mtl_textures(file.path())?;
        assert_eq!(textures, vec!["material0.jpeg", "spec.png", "normal.png"]);

        Ok(())
    }
}
