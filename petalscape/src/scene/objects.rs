use crate::math::{Mat4, Pose, clamp_unit};
use crate::scene::mesh::Mesh;

/// Represents the listener (the "ears") in the 3D audio world.
///
/// There is at most one listener per engine. All spatial sources are evaluated
/// relative to its transform.
#[derive(Debug, Clone)]
pub struct Listener {
    pub(crate) transform: Mat4,
    pub(crate) gain: f64,
    pub(crate) head_tracking: bool,
}

impl Listener {
    pub fn new() -> Self {
        Self {
            transform: Mat4::IDENTITY,
            gain: 1.0,
            head_tracking: false,
        }
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn pose(&self) -> Pose {
        Pose::from_transform(&self.transform)
    }

    /// Gain in [0, 1]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.gain = clamp_unit(gain);
    }

    pub fn head_tracking(&self) -> bool {
        self.head_tracking
    }

    pub fn set_head_tracking(&mut self, enabled: bool) {
        self.head_tracking = enabled;
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

/// Geometric representation of a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceShape {
    /// No geometry, emits from the transform's origin
    Point,
    /// Emits from the surface of a mesh
    Volumetric(Mesh),
}

/// A 3D audio source that playback instances are bound to.
#[derive(Debug, Clone)]
pub struct Source {
    pub(crate) transform: Mat4,
    pub(crate) gain: f64,
    pub(crate) shape: SourceShape,
}

impl Source {
    pub fn new(shape: SourceShape) -> Self {
        Self {
            transform: Mat4::IDENTITY,
            gain: 1.0,
            shape,
        }
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn pose(&self) -> Pose {
        Pose::from_transform(&self.transform)
    }

    /// Gain in [0, 1]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn set_gain(&mut self, gain: f64) {
        self.gain = clamp_unit(gain);
    }

    pub fn shape(&self) -> &SourceShape {
        &self.shape
    }

    pub fn is_volumetric(&self) -> bool {
        matches!(self.shape, SourceShape::Volumetric(_))
    }
}

/// Sound-blocking geometry with an optional material reference.
#[derive(Debug, Clone)]
pub struct Occluder {
    pub(crate) transform: Mat4,
    pub(crate) mesh: Mesh,
    pub(crate) material: Option<String>,
}

impl Occluder {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            transform: Mat4::IDENTITY,
            mesh,
            material: None,
        }
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Name of the assigned material, resolved lazily at evaluation time
    pub fn material_name(&self) -> Option<&str> {
        self.material.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_setters_clamp() {
        let mut source = Source::new(SourceShape::Point);
        for (input, expected) in [(-1.0, 0.0), (0.0, 0.0), (0.4, 0.4), (1.0, 1.0), (3.5, 1.0)] {
            source.set_gain(input);
            assert_eq!(source.gain(), expected);
        }

        let mut listener = Listener::new();
        listener.set_gain(1.2);
        assert_eq!(listener.gain(), 1.0);
        listener.set_gain(f64::NAN);
        assert_eq!(listener.gain(), 0.0);
    }
}
