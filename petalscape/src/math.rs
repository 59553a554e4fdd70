//! Math types for PetalScape

use crate::error::{PetalScapeError, Result};
pub use glam::{Mat4, Quat, Vec3};

/// Position and orientation extracted from a 4x4 transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Decomposes a transform, discarding scale.
    pub fn from_transform(transform: &Mat4) -> Self {
        let (_, rotation, position) = transform.to_scale_rotation_translation();
        Self { position, rotation }
    }

    pub fn to_transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Rejects matrices containing NaN or infinite entries.
pub fn validate_transform(transform: &Mat4) -> Result<()> {
    if transform.is_finite() {
        Ok(())
    } else {
        Err(PetalScapeError::InvalidTransform(
            "transform contains non-finite values".into(),
        ))
    }
}

/// Clamps a gain or level into [0, 1]. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pose_round_trip_through_transform() {
        let pose = Pose::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        let back = Pose::from_transform(&pose.to_transform());
        assert_relative_eq!(back.position.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(back.position.z, 3.0, epsilon = 1e-5);
        assert_relative_eq!(back.forward().x, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_validate_transform() {
        assert!(validate_transform(&Mat4::IDENTITY).is_ok());
        let mut bad = Mat4::IDENTITY;
        bad.w_axis.x = f32::NAN;
        assert!(validate_transform(&bad).is_err());
    }

    #[test]
    fn test_clamp_unit() {
        assert_eq!(clamp_unit(-0.5), 0.0);
        assert_eq!(clamp_unit(0.25), 0.25);
        assert_eq!(clamp_unit(7.0), 1.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
    }
}
