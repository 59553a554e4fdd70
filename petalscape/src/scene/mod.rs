//! Spatial object model: listener, sources, occluders and materials.
//!
//! # Overview
//!
//! 1. **Listener** - optional singleton "ears" of the world
//! 2. **Source** - point or volumetric emitter that playback instances bind to
//! 3. **Occluder** - mesh that attenuates the direct path by its material's transmission
//! 4. **MaterialLibrary** - named acoustic materials, looked up by occluders at evaluation time
//!
//! Every mutation is a plain state write; the engine's update tick reads the
//! current state when it evaluates spatial gains.

pub mod material;
pub mod mesh;
pub mod objects;

pub use material::{AcousticMaterial, AcousticProperties, MaterialLibrary, MaterialPreset};
pub use mesh::Mesh;
pub use objects::{Listener, Occluder, Source, SourceShape};

use crate::error::{PetalScapeError, Result};
use crate::handle::{Handle, HandleAllocator, Registry};
use crate::math::{Mat4, Vec3, validate_transform};

/// Global late-reverb presets for the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReverbPreset {
    #[default]
    None,
    Cathedral,
    LargeChamber,
    LargeHall,
    LargeRoom1,
    LargeRoom2,
    MechanicsHall,
    MediumChamber,
    MediumHall1,
    MediumHall2,
    MediumHall3,
    MediumRoom,
    SmallRoom,
}

impl ReverbPreset {
    /// Maps a raw preset index (0 = None) as passed by host integrations.
    pub fn from_index(index: i32) -> Option<Self> {
        const ALL: [ReverbPreset; 13] = [
            ReverbPreset::None,
            ReverbPreset::Cathedral,
            ReverbPreset::LargeChamber,
            ReverbPreset::LargeHall,
            ReverbPreset::LargeRoom1,
            ReverbPreset::LargeRoom2,
            ReverbPreset::MechanicsHall,
            ReverbPreset::MediumChamber,
            ReverbPreset::MediumHall1,
            ReverbPreset::MediumHall2,
            ReverbPreset::MediumHall3,
            ReverbPreset::MediumRoom,
            ReverbPreset::SmallRoom,
        ];
        usize::try_from(index).ok().and_then(|i| ALL.get(i).copied())
    }
}

/// All acoustically relevant objects of the world.
#[derive(Debug, Default)]
pub struct Scene {
    listener: Option<Listener>,
    sources: Registry<Source>,
    occluders: Registry<Occluder>,
    materials: MaterialLibrary,
    reverb: ReverbPreset,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_listener(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Err(PetalScapeError::AlreadyExists("listener".into()));
        }
        self.listener = Some(Listener::new());
        Ok(())
    }

    pub fn destroy_listener(&mut self) -> Result<()> {
        self.listener
            .take()
            .map(|_| ())
            .ok_or_else(|| PetalScapeError::NotFound("listener".into()))
    }

    pub fn listener(&self) -> Option<&Listener> {
        self.listener.as_ref()
    }

    pub fn listener_mut(&mut self) -> Result<&mut Listener> {
        self.listener
            .as_mut()
            .ok_or_else(|| PetalScapeError::NotFound("listener".into()))
    }

    pub fn set_listener_transform(&mut self, transform: Mat4) -> Result<()> {
        validate_transform(&transform)?;
        self.listener_mut()?.transform = transform;
        Ok(())
    }

    pub fn create_source(&mut self, allocator: &HandleAllocator, shape: SourceShape) -> Handle {
        self.sources.insert(allocator, Source::new(shape))
    }

    pub fn source(&self, handle: Handle) -> Result<&Source> {
        self.sources.get(handle)
    }

    pub fn source_mut(&mut self, handle: Handle) -> Result<&mut Source> {
        self.sources.get_mut(handle)
    }

    pub fn set_source_transform(&mut self, handle: Handle, transform: Mat4) -> Result<()> {
        validate_transform(&transform)?;
        self.sources.get_mut(handle)?.transform = transform;
        Ok(())
    }

    pub fn destroy_source(&mut self, handle: Handle) -> Result<Source> {
        self.sources.remove(handle)
    }

    pub fn create_occluder(&mut self, allocator: &HandleAllocator, mesh: Mesh) -> Handle {
        self.occluders.insert(allocator, Occluder::new(mesh))
    }

    pub fn occluder(&self, handle: Handle) -> Result<&Occluder> {
        self.occluders.get(handle)
    }

    pub fn set_occluder_transform(&mut self, handle: Handle, transform: Mat4) -> Result<()> {
        validate_transform(&transform)?;
        self.occluders.get_mut(handle)?.transform = transform;
        Ok(())
    }

    /// Assigns a material by name. The material must exist at assignment time;
    /// later redefinitions or removals are picked up on evaluation.
    pub fn set_occluder_material(&mut self, handle: Handle, material: &str) -> Result<()> {
        if !self.materials.contains(material) {
            return Err(PetalScapeError::NotFound(format!("material '{}'", material)));
        }
        self.occluders.get_mut(handle)?.material = Some(material.to_string());
        Ok(())
    }

    pub fn destroy_occluder(&mut self, handle: Handle) -> Result<Occluder> {
        self.occluders.remove(handle)
    }

    pub fn materials(&self) -> &MaterialLibrary {
        &self.materials
    }

    pub fn define_material(&mut self, name: &str, material: AcousticMaterial) -> Result<bool> {
        self.materials.define(name, material)
    }

    /// Removes a material. Occluders referencing it become materialless.
    pub fn destroy_material(&mut self, name: &str) -> Result<()> {
        self.materials
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PetalScapeError::NotFound(format!("material '{}'", name)))
    }

    /// Resolves the occluder's material as of now.
    ///
    /// Returns `Ok(None)` when no material is assigned or the assigned name no
    /// longer exists.
    pub fn occluder_acoustics(&self, handle: Handle) -> Result<Option<AcousticMaterial>> {
        let occluder = self.occluders.get(handle)?;
        Ok(occluder
            .material
            .as_deref()
            .and_then(|name| self.materials.get(name))
            .copied())
    }

    pub fn reverb_preset(&self) -> ReverbPreset {
        self.reverb
    }

    pub fn set_reverb_preset(&mut self, preset: ReverbPreset) {
        self.reverb = preset;
    }

    pub fn listener_position(&self) -> Option<Vec3> {
        self.listener.as_ref().map(|l| l.pose().position)
    }

    /// Distance from the listener to the source, or from the origin when no
    /// listener exists.
    pub fn listener_source_distance(&self, source: Handle) -> Result<f32> {
        let source_position = self.sources.get(source)?.pose().position;
        let listener_position = self.listener_position().unwrap_or(Vec3::ZERO);
        Ok(listener_position.distance(source_position))
    }

    /// Product of mid-band transmission of every occluder crossing the
    /// straight line between `from` and `to`.
    pub fn occlusion_factor(&self, from: Vec3, to: Vec3) -> f32 {
        self.occluders
            .iter()
            .filter(|(_, occluder)| occluder.mesh.intersects_segment(&occluder.transform, from, to))
            .map(|(_, occluder)| {
                occluder
                    .material
                    .as_deref()
                    .and_then(|name| self.materials.get(name))
                    .unwrap_or(&AcousticMaterial::GENERIC)
                    .mid_transmission()
            })
            .product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_with_wall() -> (Scene, HandleAllocator, Handle) {
        let allocator = HandleAllocator::new();
        let mut scene = Scene::new();
        let occluder = scene.create_occluder(&allocator, Mesh::cuboid(Vec3::new(2.0, 2.0, 0.1)));
        scene
            .set_occluder_transform(occluder, Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)))
            .unwrap();
        (scene, allocator, occluder)
    }

    #[test]
    fn test_listener_singleton() {
        let mut scene = Scene::new();
        assert!(scene.create_listener().is_ok());
        assert!(matches!(
            scene.create_listener(),
            Err(PetalScapeError::AlreadyExists(_))
        ));
        assert!(scene.destroy_listener().is_ok());
        assert!(scene.destroy_listener().is_err());
        assert!(scene.create_listener().is_ok());
    }

    #[test]
    fn test_destroyed_source_is_invalid() {
        let allocator = HandleAllocator::new();
        let mut scene = Scene::new();
        let source = scene.create_source(&allocator, SourceShape::Point);
        scene.destroy_source(source).unwrap();
        assert_eq!(
            scene.set_source_transform(source, Mat4::IDENTITY),
            Err(PetalScapeError::InvalidHandle(source))
        );
        assert!(scene.destroy_source(source).is_err());
    }

    #[test]
    fn test_non_finite_transform_rejected() {
        let allocator = HandleAllocator::new();
        let mut scene = Scene::new();
        let source = scene.create_source(&allocator, SourceShape::Point);
        let bad = Mat4::from_translation(Vec3::new(f32::INFINITY, 0.0, 0.0));
        assert!(matches!(
            scene.set_source_transform(source, bad),
            Err(PetalScapeError::InvalidTransform(_))
        ));
    }

    #[test]
    fn test_material_reassignment_changes_acoustics() {
        let (mut scene, _, occluder) = scene_with_wall();
        scene
            .define_material("glass", AcousticMaterial::from_preset(MaterialPreset::Glass))
            .unwrap();
        scene
            .define_material("wood", AcousticMaterial::from_preset(MaterialPreset::Wood))
            .unwrap();

        assert_eq!(scene.occluder_acoustics(occluder).unwrap(), None);

        scene.set_occluder_material(occluder, "wood").unwrap();
        assert_eq!(
            scene.occluder_acoustics(occluder).unwrap(),
            Some(AcousticMaterial::WOOD)
        );

        scene.set_occluder_material(occluder, "glass").unwrap();
        assert_eq!(
            scene.occluder_acoustics(occluder).unwrap(),
            Some(AcousticMaterial::GLASS)
        );
    }

    #[test]
    fn test_destroyed_material_leaves_occluder_materialless() {
        let (mut scene, _, occluder) = scene_with_wall();
        scene.define_material("wood", AcousticMaterial::WOOD).unwrap();
        scene.set_occluder_material(occluder, "wood").unwrap();
        scene.destroy_material("wood").unwrap();

        assert_eq!(scene.occluder_acoustics(occluder).unwrap(), None);
        assert_eq!(scene.occluder(occluder).unwrap().material_name(), Some("wood"));
        assert!(scene.set_occluder_material(occluder, "wood").is_err());
    }

    #[test]
    fn test_occlusion_uses_current_material_definition() {
        let (mut scene, _, occluder) = scene_with_wall();
        scene.define_material("wall", AcousticMaterial::WOOD).unwrap();
        scene.set_occluder_material(occluder, "wall").unwrap();

        let from = Vec3::new(0.2, 0.3, 0.0);
        let to = Vec3::new(0.2, 0.3, -10.0);
        let wood = scene.occlusion_factor(from, to);
        assert!((wood - AcousticMaterial::WOOD.mid_transmission()).abs() < 1e-6);

        scene.define_material("wall", AcousticMaterial::GLASS).unwrap();
        let glass = scene.occlusion_factor(from, to);
        assert!((glass - AcousticMaterial::GLASS.mid_transmission()).abs() < 1e-6);

        let clear = scene.occlusion_factor(from, Vec3::new(0.2, 0.3, -2.0));
        assert_eq!(clear, 1.0);
    }

    #[test]
    fn test_reverb_preset_from_index() {
        assert_eq!(ReverbPreset::from_index(0), Some(ReverbPreset::None));
        assert_eq!(ReverbPreset::from_index(12), Some(ReverbPreset::SmallRoom));
        assert_eq!(ReverbPreset::from_index(13), None);
        assert_eq!(ReverbPreset::from_index(-1), None);
    }
}
