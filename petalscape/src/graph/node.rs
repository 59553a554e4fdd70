//! Sound-event node definitions.

use crate::error::{PetalScapeError, Result};
use crate::handle::Handle;
use crate::math::clamp_unit;
use crate::stream::StreamFormat;
use std::collections::HashSet;

/// How a terminal node's level is interpreted by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CalibrationMode {
    #[default]
    None,
    /// Level in dB relative to the renderer's reference SPL
    RelativeSpl,
    /// Level in absolute dB SPL
    AbsoluteSpl,
}

/// What a switch node does when its parameter matches no entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SwitchFallback {
    /// Produce no units
    #[default]
    Silent,
    /// Play the first entry
    FirstEntry,
    /// Play the entry registered under this label
    Label(String),
}

/// Plays a registered audio asset on a mixer.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerNode {
    pub asset: String,
    pub mixer: Handle,
    /// Numeric parameter scaling the playback rate (1.0 when unset)
    pub rate_parameter: Option<Handle>,
    pub looping: bool,
    pub calibration: CalibrationMode,
    pub level: f64,
}

impl SamplerNode {
    pub fn new(asset: &str, mixer: Handle) -> Self {
        Self {
            asset: asset.to_string(),
            mixer,
            rate_parameter: None,
            looping: false,
            calibration: CalibrationMode::None,
            level: 1.0,
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_rate_parameter(mut self, parameter: Handle) -> Self {
        self.rate_parameter = Some(parameter);
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationMode, level: f64) -> Self {
        self.calibration = calibration;
        self.level = level;
        self
    }
}

/// Plays audio pulled from a stream reader supplied at play time.
#[derive(Debug, Clone, PartialEq)]
pub struct PullStreamNode {
    pub stream: String,
    pub mixer: Handle,
    pub format: StreamFormat,
    pub calibration: CalibrationMode,
    pub level: f64,
}

impl PullStreamNode {
    pub fn new(stream: &str, mixer: Handle, format: StreamFormat) -> Self {
        Self {
            stream: stream.to_string(),
            mixer,
            format,
            calibration: CalibrationMode::None,
            level: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchNode {
    pub parameter: Handle,
    pub entries: Vec<(String, Handle)>,
    /// `None` takes the engine default
    pub fallback: Option<SwitchFallback>,
}

impl SwitchNode {
    pub fn new(parameter: Handle, entries: Vec<(String, Handle)>) -> Self {
        Self {
            parameter,
            entries,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: SwitchFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn child_for(&self, label: &str) -> Option<Handle> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, child)| *child)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomEntry {
    pub child: Handle,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomNode {
    pub entries: Vec<RandomEntry>,
    /// Number of recent picks excluded from the next draw. 0 disables.
    pub unique_selection_queue: usize,
}

impl RandomNode {
    pub fn new(entries: Vec<(Handle, f32)>, unique_selection_queue: usize) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(child, weight)| RandomEntry { child, weight })
                .collect(),
            unique_selection_queue,
        }
    }
}

/// A child of a blend node and the value range it is audible in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendRange {
    pub child: Handle,
    pub low: f64,
    pub full_gain_at_low: f64,
    pub full_gain_at_high: f64,
    pub high: f64,
}

impl BlendRange {
    pub fn new(child: Handle, low: f64, full_gain_at_low: f64, full_gain_at_high: f64, high: f64) -> Self {
        Self {
            child,
            low,
            full_gain_at_low,
            full_gain_at_high,
            high,
        }
    }

    /// Gain of this range's child for the controlling `value`.
    ///
    /// 1 on [full_gain_at_low, full_gain_at_high], linear ramps to 0 at
    /// `low` and `high`, 0 outside.
    pub fn gain(&self, value: f64) -> f64 {
        if value.is_nan() || value < self.low || value > self.high {
            0.0
        } else if value < self.full_gain_at_low {
            (value - self.low) / (self.full_gain_at_low - self.low)
        } else if value > self.full_gain_at_high {
            (self.high - value) / (self.high - self.full_gain_at_high)
        } else {
            1.0
        }
    }

    fn validate(&self) -> Result<()> {
        let ordered = self.low <= self.full_gain_at_low
            && self.full_gain_at_low <= self.full_gain_at_high
            && self.full_gain_at_high <= self.high;
        let finite = [self.low, self.full_gain_at_low, self.full_gain_at_high, self.high]
            .iter()
            .all(|v| v.is_finite());
        if !(ordered && finite) {
            return Err(PetalScapeError::Validation(format!(
                "blend range must satisfy low <= full_low <= full_high <= high, got {} {} {} {}",
                self.low, self.full_gain_at_low, self.full_gain_at_high, self.high
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlendNode {
    /// Controlling numeric parameter; ignored when `auto_distance` is set
    pub parameter: Option<Handle>,
    pub ranges: Vec<BlendRange>,
    /// Blend on the listener-to-source distance instead of a parameter
    pub auto_distance: bool,
}

impl BlendNode {
    pub fn with_parameter(parameter: Handle, ranges: Vec<BlendRange>) -> Self {
        Self {
            parameter: Some(parameter),
            ranges,
            auto_distance: false,
        }
    }

    pub fn auto_distance(ranges: Vec<BlendRange>) -> Self {
        Self {
            parameter: None,
            ranges,
            auto_distance: true,
        }
    }
}

/// One node of a sound-event graph.
///
/// Children are plain handles into the node registry; nothing here owns its
/// children.
#[derive(Debug, Clone, PartialEq)]
pub enum SoundEventNode {
    Sampler(SamplerNode),
    PullStream(PullStreamNode),
    Switch(SwitchNode),
    Random(RandomNode),
    Blend(BlendNode),
    Container(Vec<Handle>),
}

impl SoundEventNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Sampler(_) => "sampler",
            Self::PullStream(_) => "pull-stream",
            Self::Switch(_) => "switch",
            Self::Random(_) => "random",
            Self::Blend(_) => "blend",
            Self::Container(_) => "container",
        }
    }

    /// Direct children in declaration order.
    pub fn children(&self) -> Vec<Handle> {
        match self {
            Self::Sampler(_) | Self::PullStream(_) => Vec::new(),
            Self::Switch(node) => node.entries.iter().map(|(_, child)| *child).collect(),
            Self::Random(node) => node.entries.iter().map(|e| e.child).collect(),
            Self::Blend(node) => node.ranges.iter().map(|r| r.child).collect(),
            Self::Container(children) => children.clone(),
        }
    }

    /// Checks everything that can be checked without looking at other entities.
    ///
    /// Terminal levels are clamped in place.
    pub(crate) fn normalize(&mut self) -> Result<()> {
        match self {
            Self::Sampler(node) => {
                if node.asset.is_empty() {
                    return Err(PetalScapeError::Validation(
                        "sampler asset name must not be empty".into(),
                    ));
                }
                node.level = clamp_level(node.calibration, node.level)?;
            }
            Self::PullStream(node) => {
                if node.stream.is_empty() {
                    return Err(PetalScapeError::Validation(
                        "pull-stream name must not be empty".into(),
                    ));
                }
                node.format.validate()?;
                node.level = clamp_level(node.calibration, node.level)?;
            }
            Self::Switch(node) => {
                let mut labels = HashSet::new();
                for (label, _) in &node.entries {
                    if !labels.insert(label.as_str()) {
                        return Err(PetalScapeError::Validation(format!(
                            "duplicate switch label '{}'",
                            label
                        )));
                    }
                }
                if let Some(SwitchFallback::Label(label)) = &node.fallback {
                    if !labels.contains(label.as_str()) {
                        return Err(PetalScapeError::Validation(format!(
                            "switch fallback label '{}' has no entry",
                            label
                        )));
                    }
                }
            }
            Self::Random(node) => {
                if let Some(entry) = node
                    .entries
                    .iter()
                    .find(|e| !(e.weight.is_finite() && e.weight > 0.0))
                {
                    return Err(PetalScapeError::Validation(format!(
                        "random entry weight must be positive, got {}",
                        entry.weight
                    )));
                }
            }
            Self::Blend(node) => {
                if !node.auto_distance && node.parameter.is_none() {
                    return Err(PetalScapeError::Validation(
                        "blend node needs a parameter unless it blends on distance".into(),
                    ));
                }
                for range in &node.ranges {
                    range.validate()?;
                }
                reject_duplicate_children(node.ranges.iter().map(|r| r.child))?;
            }
            Self::Container(children) => {
                reject_duplicate_children(children.iter().copied())?;
            }
        }
        Ok(())
    }
}

/// Relative and absolute SPL levels are dB values; plain levels are linear gains.
fn clamp_level(calibration: CalibrationMode, level: f64) -> Result<f64> {
    match calibration {
        CalibrationMode::None => Ok(clamp_unit(level)),
        CalibrationMode::RelativeSpl | CalibrationMode::AbsoluteSpl if level.is_finite() => {
            Ok(level)
        }
        _ => Err(PetalScapeError::Validation(format!(
            "calibrated level must be finite, got {}",
            level
        ))),
    }
}

fn reject_duplicate_children(children: impl Iterator<Item = Handle>) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if !seen.insert(child) {
            return Err(PetalScapeError::Validation(format!(
                "{} appears twice among the node's children",
                child
            )));
        }
    }
    Ok(())
}
