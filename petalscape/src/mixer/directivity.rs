//! Directivity models for spatial mixers.

use crate::error::{PetalScapeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectivityType {
    /// Omnidirectional
    #[default]
    None,
    Cardioid,
    Cone,
}

/// Parameters for one frequency subband of a directivity model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectivitySubband {
    /// Subband center frequency in Hz
    pub frequency: f32,
    /// Cardioid pattern blend (0 = omni, 0.5 = cardioid, 1 = dipole)
    pub pattern: f32,
    /// Cardioid sharpness exponent (>= 1)
    pub sharpness: f32,
    /// Cone inner angle in degrees
    pub inner_angle: f32,
    /// Cone outer angle in degrees
    pub outer_angle: f32,
    /// Cone gain outside the outer angle
    pub outer_gain: f32,
}

impl DirectivitySubband {
    pub fn cardioid(frequency: f32, pattern: f32, sharpness: f32) -> Self {
        Self {
            frequency,
            pattern,
            sharpness,
            inner_angle: 0.0,
            outer_angle: 0.0,
            outer_gain: 0.0,
        }
    }

    pub fn cone(frequency: f32, inner_angle: f32, outer_angle: f32, outer_gain: f32) -> Self {
        Self {
            frequency,
            pattern: 0.0,
            sharpness: 1.0,
            inner_angle,
            outer_angle,
            outer_gain,
        }
    }
}

/// Directivity model attached to a spatial mixer, for the source or the listener.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectivityModel {
    pub directivity_type: DirectivityType,
    pub subbands: Vec<DirectivitySubband>,
}

impl DirectivityModel {
    pub fn omni() -> Self {
        Self::default()
    }

    pub fn cardioid(subbands: Vec<DirectivitySubband>) -> Self {
        Self {
            directivity_type: DirectivityType::Cardioid,
            subbands,
        }
    }

    pub fn cone(subbands: Vec<DirectivitySubband>) -> Self {
        Self {
            directivity_type: DirectivityType::Cone,
            subbands,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.directivity_type {
            DirectivityType::None => Ok(()),
            DirectivityType::Cardioid | DirectivityType::Cone if self.subbands.is_empty() => {
                Err(PetalScapeError::Validation(format!(
                    "{:?} directivity requires at least one subband",
                    self.directivity_type
                )))
            }
            DirectivityType::Cardioid => self.subbands.iter().try_for_each(|band| {
                validate_frequency(band.frequency)?;
                if !(0.0..=1.0).contains(&band.pattern) {
                    return Err(PetalScapeError::Validation(
                        "cardioid pattern must be in [0, 1]".into(),
                    ));
                }
                if !(band.sharpness >= 1.0 && band.sharpness.is_finite()) {
                    return Err(PetalScapeError::Validation(
                        "cardioid sharpness must be >= 1".into(),
                    ));
                }
                Ok(())
            }),
            DirectivityType::Cone => self.subbands.iter().try_for_each(|band| {
                validate_frequency(band.frequency)?;
                if !(0.0 <= band.inner_angle
                    && band.inner_angle <= band.outer_angle
                    && band.outer_angle <= 360.0)
                {
                    return Err(PetalScapeError::Validation(
                        "cone angles must satisfy 0 <= inner <= outer <= 360".into(),
                    ));
                }
                if !(0.0..=1.0).contains(&band.outer_gain) {
                    return Err(PetalScapeError::Validation(
                        "cone outer gain must be in [0, 1]".into(),
                    ));
                }
                Ok(())
            }),
        }
    }

    /// Broadband gain at `angle` radians off the model's forward axis.
    ///
    /// Uses the first subband.
    pub fn gain(&self, angle: f32) -> f32 {
        let Some(band) = self.subbands.first() else {
            return 1.0;
        };

        match self.directivity_type {
            DirectivityType::None => 1.0,
            DirectivityType::Cardioid => {
                let base = (1.0 - band.pattern) + band.pattern * angle.cos();
                base.max(0.0).powf(band.sharpness)
            }
            DirectivityType::Cone => {
                let degrees = angle.to_degrees().abs();
                let inner = band.inner_angle * 0.5;
                let outer = band.outer_angle * 0.5;
                if degrees <= inner {
                    1.0
                } else if degrees >= outer {
                    band.outer_gain
                } else {
                    let t = (degrees - inner) / (outer - inner);
                    1.0 + t * (band.outer_gain - 1.0)
                }
            }
        }
    }
}

fn validate_frequency(frequency: f32) -> Result<()> {
    if frequency > 0.0 && frequency.is_finite() {
        Ok(())
    } else {
        Err(PetalScapeError::Validation(
            "directivity subband frequency must be > 0".into(),
        ))
    }
}
