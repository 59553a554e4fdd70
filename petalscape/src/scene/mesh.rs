//! Triangle meshes for volumetric sources and occluders.

use crate::error::{PetalScapeError, Result};
use crate::math::{Mat4, Vec3};

/// Indexed triangle mesh, copied from caller-supplied buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    indices: Vec<u32>,
}

impl Mesh {
    /// Copies and validates mesh data.
    ///
    /// Positions and normals must be parallel arrays, the index count must be a
    /// non-zero multiple of three and every index must be in range.
    pub fn new(positions: &[Vec3], normals: &[Vec3], indices: &[u32]) -> Result<Self> {
        if positions.is_empty() {
            return Err(PetalScapeError::Validation("mesh has no vertices".into()));
        }
        if positions.len() != normals.len() {
            return Err(PetalScapeError::Validation(format!(
                "mesh has {} positions but {} normals",
                positions.len(),
                normals.len()
            )));
        }
        if indices.is_empty() || indices.len() % 3 != 0 {
            return Err(PetalScapeError::Validation(format!(
                "mesh index count {} is not a non-zero multiple of 3",
                indices.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            return Err(PetalScapeError::Validation(format!(
                "mesh index {} out of range for {} vertices",
                bad,
                positions.len()
            )));
        }
        if !positions.iter().chain(normals.iter()).all(|v| v.is_finite()) {
            return Err(PetalScapeError::Validation(
                "mesh contains non-finite vertex data".into(),
            ));
        }

        Ok(Self {
            positions: positions.to_vec(),
            normals: normals.to_vec(),
            indices: indices.to_vec(),
        })
    }

    /// Axis-aligned box centered at the origin, handy for tests and demos.
    pub fn cuboid(half_extents: Vec3) -> Self {
        let h = half_extents;
        let positions = vec![
            Vec3::new(-h.x, -h.y, -h.z),
            Vec3::new(h.x, -h.y, -h.z),
            Vec3::new(h.x, h.y, -h.z),
            Vec3::new(-h.x, h.y, -h.z),
            Vec3::new(-h.x, -h.y, h.z),
            Vec3::new(h.x, -h.y, h.z),
            Vec3::new(h.x, h.y, h.z),
            Vec3::new(-h.x, h.y, h.z),
        ];
        let normals = positions.iter().map(|p| p.normalize_or_zero()).collect();
        let indices = vec![
            0, 2, 1, 0, 3, 2, // -z
            4, 5, 6, 4, 6, 7, // +z
            0, 1, 5, 0, 5, 4, // -y
            3, 7, 6, 3, 6, 2, // +y
            0, 4, 7, 0, 7, 3, // -x
            1, 2, 6, 1, 6, 5, // +x
        ];
        Self {
            positions,
            normals,
            indices,
        }
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Returns true if the segment `from -> to` crosses any triangle of the
    /// mesh placed in the world by `transform`.
    pub fn intersects_segment(&self, transform: &Mat4, from: Vec3, to: Vec3) -> bool {
        let direction = to - from;
        if direction.length_squared() <= f32::EPSILON {
            return false;
        }

        self.indices.chunks_exact(3).any(|tri| {
            let a = transform.transform_point3(self.positions[tri[0] as usize]);
            let b = transform.transform_point3(self.positions[tri[1] as usize]);
            let c = transform.transform_point3(self.positions[tri[2] as usize]);
            segment_hits_triangle(from, direction, a, b, c)
        })
    }
}

/// Moller-Trumbore, restricted to the parameter range (0, 1).
fn segment_hits_triangle(origin: Vec3, direction: Vec3, a: Vec3, b: Vec3, c: Vec3) -> bool {
    const EPS: f32 = 1e-7;

    let edge1 = b - a;
    let edge2 = c - a;
    let p = direction.cross(edge2);
    let det = edge1.dot(p);
    if det.abs() < EPS {
        return false;
    }

    let inv_det = 1.0 / det;
    let s = origin - a;
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return false;
    }

    let q = s.cross(edge1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return false;
    }

    let t = edge2.dot(q) * inv_det;
    t > EPS && t < 1.0 - EPS
}
