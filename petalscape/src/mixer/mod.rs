//! Mixing busses that render units are routed through.
//!
//! Three kinds exist:
//! - [`MixerKind::Spatial`]: distance, directivity and occlusion modeling
//! - [`MixerKind::Channel`]: plays straight into a channel layout
//! - [`MixerKind::Ambient`]: channel layout with a fixed orientation around the listener
//!
//! Samplers reference mixers by handle. Destroying a mixer does not touch the
//! samplers pointing at it; they fail when next played.

pub mod directivity;

pub use directivity::{DirectivityModel, DirectivitySubband, DirectivityType};

use crate::error::{PetalScapeError, Result};
use crate::handle::Handle;
use crate::math::{Pose, Quat, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelLayout {
    Mono,
    #[default]
    Stereo,
    FiveOne,
    SevenOne,
}

impl ChannelLayout {
    pub fn channel_count(&self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::FiveOne => 6,
            Self::SevenOne => 8,
        }
    }
}

/// Parameters of a spatial mixer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialMixerDesc {
    pub enable_direct_path: bool,
    pub enable_early_reflections: bool,
    pub enable_late_reverb: bool,
    /// Distance beyond which the source is culled. 0 disables culling.
    pub cull_distance: f64,
    /// Exponent of the geometric spreading model
    pub rolloff_factor: f32,
    pub source_directivity: DirectivityModel,
    pub listener_directivity: DirectivityModel,
}

impl Default for SpatialMixerDesc {
    fn default() -> Self {
        Self {
            enable_direct_path: true,
            enable_early_reflections: false,
            enable_late_reverb: false,
            cull_distance: 0.0,
            rolloff_factor: 1.0,
            source_directivity: DirectivityModel::omni(),
            listener_directivity: DirectivityModel::omni(),
        }
    }
}

impl SpatialMixerDesc {
    pub fn validate(&self) -> Result<()> {
        if !(self.cull_distance.is_finite() && self.cull_distance >= 0.0) {
            return Err(PetalScapeError::Validation(format!(
                "cull distance must be finite and >= 0, got {}",
                self.cull_distance
            )));
        }
        if !(self.rolloff_factor.is_finite() && self.rolloff_factor >= 0.0) {
            return Err(PetalScapeError::Validation(format!(
                "rolloff factor must be finite and >= 0, got {}",
                self.rolloff_factor
            )));
        }
        self.source_directivity.validate()?;
        self.listener_directivity.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MixerKind {
    Spatial(SpatialMixerDesc),
    Channel { layout: ChannelLayout },
    Ambient { layout: ChannelLayout, orientation: Quat },
}

/// A named mixer definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixer {
    pub name: String,
    pub kind: MixerKind,
    /// Optional meta-parameter scaling every unit on this mixer
    pub gain_parameter: Option<Handle>,
}

impl Mixer {
    pub fn new(name: &str, kind: MixerKind) -> Result<Self> {
        match &kind {
            MixerKind::Spatial(desc) => desc.validate()?,
            MixerKind::Channel { .. } => {}
            MixerKind::Ambient { orientation, .. } => {
                if !orientation.is_finite() || orientation.length_squared() <= f32::EPSILON {
                    return Err(PetalScapeError::Validation(
                        "ambient mixer orientation must be a finite, non-zero quaternion".into(),
                    ));
                }
            }
        }

        let kind = match kind {
            MixerKind::Ambient {
                layout,
                orientation,
            } => MixerKind::Ambient {
                layout,
                orientation: orientation.normalize(),
            },
            other => other,
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            gain_parameter: None,
        })
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.kind, MixerKind::Spatial(_))
    }

    /// Geometric gain for a source heard by a listener, before occlusion.
    ///
    /// Returns 1.0 for non-spatial mixers.
    pub fn spatial_gain(&self, source: &Pose, listener: &Pose) -> f32 {
        let MixerKind::Spatial(desc) = &self.kind else {
            return 1.0;
        };

        let offset = source.position - listener.position;
        let distance = offset.length();
        if desc.cull_distance > 0.0 && f64::from(distance) > desc.cull_distance {
            return 0.0;
        }

        let attenuation = (1.0 / distance.max(1.0)).powf(desc.rolloff_factor);

        let (source_angle, listener_angle) = if distance > f32::EPSILON {
            let to_listener = -offset / distance;
            let to_source = offset / distance;
            (
                angle_between(source.forward(), to_listener),
                angle_between(listener.forward(), to_source),
            )
        } else {
            (0.0, 0.0)
        };

        attenuation
            * desc.source_directivity.gain(source_angle)
            * desc.listener_directivity.gain(listener_angle)
    }
}

fn angle_between(a: Vec3, b: Vec3) -> f32 {
    a.normalize_or_zero()
        .dot(b.normalize_or_zero())
        .clamp(-1.0, 1.0)
        .acos()
}
