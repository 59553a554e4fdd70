//! Piecewise envelopes used by mapped meta-parameters.

use crate::error::{PetalScapeError, Result};
use std::f64::consts::FRAC_PI_2;

/// Shape of the curve between two envelope breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CurveType {
    #[default]
    Linear,
    Squared,
    InverseSquared,
    Cubed,
    InverseCubed,
    Sine,
    InverseSine,
    Sigmoid,
    InverseSigmoid,
}

impl CurveType {
    /// Maps normalized progress `t` in [0, 1] onto [0, 1].
    ///
    /// Every curve passes through (0, 0) and (1, 1) and is monotonic.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::Squared => t * t,
            Self::InverseSquared => 1.0 - (1.0 - t) * (1.0 - t),
            Self::Cubed => t * t * t,
            Self::InverseCubed => 1.0 - (1.0 - t).powi(3),
            Self::Sine => (t * FRAC_PI_2).sin(),
            Self::InverseSine => 1.0 - (t * FRAC_PI_2).cos(),
            Self::Sigmoid => t * t * (3.0 - 2.0 * t),
            // inverse of the smoothstep above
            Self::InverseSigmoid => 0.5 - ((1.0 - 2.0 * t).asin() / 3.0).sin(),
        }
    }
}

/// One breakpoint of an envelope; `curve` shapes the segment that ends here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeSegment {
    pub x: f64,
    pub y: f64,
    pub curve: CurveType,
}

impl EnvelopeSegment {
    pub fn new(x: f64, y: f64, curve: CurveType) -> Self {
        Self { x, y, curve }
    }
}

/// A start point followed by ordered segments.
///
/// Inputs left of the start hold the start value, inputs right of the last
/// breakpoint hold the last value.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    start: (f64, f64),
    segments: Vec<EnvelopeSegment>,
}

impl Envelope {
    pub fn new(start: (f64, f64), segments: Vec<EnvelopeSegment>) -> Result<Self> {
        if !(start.0.is_finite() && start.1.is_finite()) {
            return Err(PetalScapeError::Validation(
                "envelope start point must be finite".into(),
            ));
        }

        let mut previous_x = start.0;
        for segment in &segments {
            if !(segment.x.is_finite() && segment.y.is_finite()) {
                return Err(PetalScapeError::Validation(
                    "envelope breakpoints must be finite".into(),
                ));
            }
            if segment.x <= previous_x {
                return Err(PetalScapeError::Validation(format!(
                    "envelope x values must be strictly increasing ({} after {})",
                    segment.x, previous_x
                )));
            }
            previous_x = segment.x;
        }

        Ok(Self { start, segments })
    }

    pub fn start(&self) -> (f64, f64) {
        self.start
    }

    pub fn segments(&self) -> &[EnvelopeSegment] {
        &self.segments
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let (mut x0, mut y0) = self.start;
        if x <= x0 {
            return y0;
        }

        for segment in &self.segments {
            if x <= segment.x {
                let t = (x - x0) / (segment.x - x0);
                return y0 + (segment.y - y0) * segment.curve.apply(t);
            }
            x0 = segment.x;
            y0 = segment.y;
        }

        y0
    }
}
