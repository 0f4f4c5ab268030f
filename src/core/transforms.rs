//! Vertex transformations.
//!
//! The alignment map is element-wise, so vertices are processed in
//! parallel with Rayon. Each output depends only on its own input, which
//! keeps results identical to a sequential pass.

use rayon::prelude::*;

/// Translate then uniformly rescale vertices in place: `v' = (v - t) / s`.
///
/// # Arguments
///
/// * `vertices` - Vertex positions to rewrite
/// * `translation` - Translation `t` subtracted from every vertex
/// * `scale` - Uniform scale `s` every translated vertex is divided by
///
/// # Example
///
/// ```
/// use scan_normalizer::core::transforms::normalize_vertices;
///
/// let mut verts = vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
/// normalize_vertices(&mut verts, [1.0, 0.0, 0.0], 2.0);
/// assert_eq!(verts, vec![[0.0, 0.5, 0.5], [0.5, 1.0, 1.0]]);
/// ```
pub fn normalize_vertices(vertices: &mut [[f64; 3]], translation: [f64; 3], scale: f64) {
    vertices.par_iter_mut().for_each(|v| {
        for axis in 0..3 {
            v[axis] = (v[axis] - translation[axis]) / scale;
        }
    });
}

/// Axis-aligned bounds of a vertex set as `(min, max)`.
///
/// Returns `None` for an empty slice.
pub fn vertex_bounds(vertices: &[[f64; 3]]) -> Option<([f64; 3], [f64; 3])> {
    if vertices.is_empty() {
        return None;
    }

    let init = ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]);
    let bounds = vertices
        .par_iter()
        .fold(
            || init,
            |(mut lo, mut hi), v| {
                for axis in 0..3 {
                    lo[axis] = lo[axis].min(v[axis]);
                    hi[axis] = hi[axis].max(v[axis]);
                }
                (lo, hi)
            },
        )
        .reduce(
            || init,
            |(mut lo, mut hi), (a, b)| {
                for axis in 0..3 {
                    lo[axis] = lo[axis].min(a[axis]);
                    hi[axis] = hi[axis].max(b[axis]);
                }
                (lo, hi)
            },
        );

    Some(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_vertices_scenario() {
        let mut verts = vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
        normalize_vertices(&mut verts, [1.0, 0.0, 0.0], 2.0);

        assert_eq!(verts[0], [0.0, 0.5, 0.5]);
        assert_eq!(verts[1], [0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_normalize_vertices_matches_formula() {
        let original: Vec<[f64; 3]> = (0..1000)
            .map(|i| {
                let f = i as f64;
                [f * 0.37, -f * 1.3, f.sin()]
            })
            .collect();
        let t = [0.25, -3.5, 12.0];
        let s = 0.87;

        let mut verts = original.clone();
        normalize_vertices(&mut verts, t, s);

        for (out, inp) in verts.iter().zip(original.iter()) {
            for axis in 0..3 {
                assert_eq!(out[axis], (inp[axis] - t[axis]) / s);
            }
        }
    }

    #[test]
    fn test_normalize_vertices_identity() {
        let original = vec![[0.1, 0.2, 0.3], [-4.0, 5.5, 1e-9]];
        let mut verts = original.clone();
        normalize_vertices(&mut verts, [0.0, 0.0, 0.0], 1.0);
        assert_eq!(verts, original);
    }

    #[test]
    fn test_normalize_vertices_empty() {
        let mut verts: Vec<[f64; 3]> = Vec::new();
        normalize_vertices(&mut verts, [1.0, 2.0, 3.0], 4.0);
        assert!(verts.is_empty());
    }

    #[test]
    fn test_vertex_bounds() {
        let verts = vec![[1.0, -2.0, 3.0], [-1.0, 5.0, 0.0], [0.0, 0.0, 9.0]];
        let (lo, hi) = vertex_bounds(&verts).unwrap();
        assert_eq!(lo, [-1.0, -2.0, 0.0]);
        assert_eq!(hi, [1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_vertex_bounds_empty() {
        assert!(vertex_bounds(&[]).is_none());
    }
}
