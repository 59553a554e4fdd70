//! Acoustic material properties and the named material library.
//!
//! Every material is a three-band spectrum at 400 Hz, 2.5 kHz and 15 kHz. Occluders reference materials by *name*, and the
//! name is resolved every time the occluder is evaluated, so redefining a
//! material changes every occluder that uses it.

use crate::error::{PetalScapeError, Result};
use std::collections::HashMap;

/// Center frequencies of the three bands, in Hz.
pub const BAND_FREQUENCIES: [f32; 3] = [400.0, 2500.0, 15000.0];

const CUSTOM_SCATTERING: f32 = 0.05;
const CUSTOM_TRANSMISSION_CEILING: f32 = 0.1;

/// Per-band behaviour of a surface. Transmission drives occlusion of the
/// direct path; absorption and scattering are carried for the renderer.
///
/// # Example
///
/// ```
/// use petalscape::scene::{AcousticMaterial, MaterialPreset};
///
/// let wall = AcousticMaterial::from_preset(MaterialPreset::Concrete);
/// assert!(wall.transmission[1] < AcousticMaterial::GLASS.transmission[1]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcousticMaterial {
    /// Absorbed energy per band, in [0, 1]
    pub absorption: [f32; 3],

    /// Diffuse share of reflected energy, in [0, 1]
    pub scattering: f32,

    /// Energy passing through the surface per band, in [0, 1]
    pub transmission: [f32; 3],
}

impl AcousticMaterial {
    /// Used for occluders that have no (or a destroyed) material assigned
    pub const GENERIC: Self = Self {
        absorption: [0.10, 0.20, 0.30],
        scattering: 0.05,
        transmission: [0.100, 0.050, 0.030],
    };

    pub const CARDBOARD: Self = Self {
        absorption: [0.25, 0.35, 0.40],
        scattering: 0.05,
        transmission: [0.300, 0.150, 0.080],
    };

    /// Reflective with moderate transmission
    pub const GLASS: Self = Self {
        absorption: [0.06, 0.03, 0.02],
        scattering: 0.05,
        transmission: [0.060, 0.044, 0.011],
    };

    /// Moderately reflective, good sound blocking
    pub const BRICK: Self = Self {
        absorption: [0.03, 0.04, 0.07],
        scattering: 0.05,
        transmission: [0.015, 0.015, 0.015],
    };

    /// Very reflective, excellent sound blocking
    pub const CONCRETE: Self = Self {
        absorption: [0.05, 0.07, 0.08],
        scattering: 0.05,
        transmission: [0.015, 0.002, 0.001],
    };

    pub const DRYWALL: Self = Self {
        absorption: [0.10, 0.05, 0.05],
        scattering: 0.05,
        transmission: [0.080, 0.030, 0.010],
    };

    /// Moderately absorptive
    pub const WOOD: Self = Self {
        absorption: [0.11, 0.07, 0.06],
        scattering: 0.05,
        transmission: [0.070, 0.014, 0.005],
    };

    pub fn from_preset(preset: MaterialPreset) -> Self {
        match preset {
            MaterialPreset::Cardboard => Self::CARDBOARD,
            MaterialPreset::Glass => Self::GLASS,
            MaterialPreset::Brick => Self::BRICK,
            MaterialPreset::Concrete => Self::CONCRETE,
            MaterialPreset::Drywall => Self::DRYWALL,
            MaterialPreset::Wood => Self::WOOD,
        }
    }

    /// Builds a material from a scale/shift/tilt absorption spectrum.
    ///
    /// Absorption at a band is `scale * (shift + tilt * octaves)` where
    /// `octaves` is the band's distance from 1 kHz in octaves, clamped to
    /// [0, 1]. Whatever is not absorbed is partially transmitted.
    pub fn from_properties(properties: AcousticProperties) -> Result<Self> {
        properties.validate()?;

        let mut absorption = [0.0; 3];
        let mut transmission = [0.0; 3];
        for (band, frequency) in BAND_FREQUENCIES.iter().enumerate() {
            let octaves = (frequency / 1000.0).log2();
            let value = properties.scale * (properties.shift + properties.tilt * octaves);
            absorption[band] = value.clamp(0.0, 1.0);
            transmission[band] = (1.0 - absorption[band]) * CUSTOM_TRANSMISSION_CEILING;
        }

        Ok(Self {
            absorption,
            scattering: CUSTOM_SCATTERING,
            transmission,
        })
    }

    /// Transmission used for broadband direct-path occlusion.
    pub fn mid_transmission(&self) -> f32 {
        self.transmission[1]
    }

    /// Every coefficient must lie in [0, 1].
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);

        if !self.absorption.iter().copied().all(in_range) {
            return Err(PetalScapeError::Validation(
                "Absorption values must be between 0.0 and 1.0".into(),
            ));
        }
        if !in_range(self.scattering) {
            return Err(PetalScapeError::Validation(
                "Scattering value must be between 0.0 and 1.0".into(),
            ));
        }
        if !self.transmission.iter().copied().all(in_range) {
            return Err(PetalScapeError::Validation(
                "Transmission values must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AcousticMaterial {
    fn default() -> Self {
        Self::GENERIC
    }
}

/// Closed set of built-in materials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialPreset {
    Cardboard,
    Glass,
    Brick,
    Concrete,
    Drywall,
    Wood,
}

/// Explicit absorption spectrum description for custom materials.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcousticProperties {
    /// Overall multiplier, must be >= 0
    pub scale: f32,
    /// Absorption at 1 kHz before scaling
    pub shift: f32,
    /// Change in absorption per octave
    pub tilt: f32,
}

impl AcousticProperties {
    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.shift.is_finite() && self.tilt.is_finite()) {
            return Err(PetalScapeError::Validation(
                "acoustic properties must be finite".into(),
            ));
        }
        if self.scale < 0.0 {
            return Err(PetalScapeError::Validation(
                "acoustic property scale must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Materials keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct MaterialLibrary {
    materials: HashMap<String, AcousticMaterial>,
}

impl MaterialLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines (or redefines) a material. Returns true if the name was new.
    pub fn define(&mut self, name: &str, material: AcousticMaterial) -> Result<bool> {
        if name.is_empty() {
            return Err(PetalScapeError::Validation(
                "material name must not be empty".into(),
            ));
        }
        material.validate()?;
        Ok(self.materials.insert(name.to_string(), material).is_none())
    }

    pub fn remove(&mut self, name: &str) -> Option<AcousticMaterial> {
        self.materials.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AcousticMaterial> {
        self.materials.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.materials.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_coefficients_rejected() {
        let base = AcousticMaterial::CONCRETE;
        assert!(base.validate().is_ok());

        let mut material = base;
        material.absorption[2] = 1.2;
        assert!(material.validate().is_err());

        let mut material = base;
        material.scattering = -0.1;
        assert!(material.validate().is_err());

        let mut material = base;
        material.transmission[0] = f32::NAN;
        assert!(material.validate().is_err());
    }

    #[test]
    fn test_all_presets_valid() {
        for preset in [
            MaterialPreset::Cardboard,
            MaterialPreset::Glass,
            MaterialPreset::Brick,
            MaterialPreset::Concrete,
            MaterialPreset::Drywall,
            MaterialPreset::Wood,
        ] {
            assert!(AcousticMaterial::from_preset(preset).validate().is_ok());
        }
    }

    #[test]
    fn test_custom_properties_tilt_raises_high_band() {
        let material = AcousticMaterial::from_properties(AcousticProperties {
            scale: 1.0,
            shift: 0.3,
            tilt: 0.05,
        })
        .unwrap();
        assert!(material.absorption[0] < material.absorption[1]);
        assert!(material.absorption[1] < material.absorption[2]);
        assert!(material.validate().is_ok());
    }

    #[test]
    fn test_custom_properties_clamped() {
        let material = AcousticMaterial::from_properties(AcousticProperties {
            scale: 10.0,
            shift: 1.0,
            tilt: 0.0,
        })
        .unwrap();
        assert_eq!(material.absorption, [1.0, 1.0, 1.0]);
        assert_eq!(material.transmission, [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_negative_scale_rejected() {
        let result = AcousticMaterial::from_properties(AcousticProperties {
            scale: -1.0,
            shift: 0.2,
            tilt: 0.0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_library_redefine() {
        let mut library = MaterialLibrary::new();
        assert!(library.define("wall", AcousticMaterial::WOOD).unwrap());
        assert!(!library.define("wall", AcousticMaterial::GLASS).unwrap());
        assert_eq!(library.get("wall"), Some(&AcousticMaterial::GLASS));
        assert_eq!(library.len(), 1);
        assert!(library.define("", AcousticMaterial::GLASS).is_err());
    }
}
