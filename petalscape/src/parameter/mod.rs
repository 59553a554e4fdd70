//! Meta-parameters: typed, runtime-adjustable values that drive graph evaluation.
//!
//! A [`MetaParameter`] is a *template*: it declares a type, a default and (for
//! numeric types) a clamp range. Each playback instance keeps private copies of
//! the values it changes in a [`ParameterValues`] map; everything else falls back
//! to the template default.
//!
//! A [`MappedMetaParameter`] wraps a plain numeric parameter and maps its current
//! value through an [`Envelope`]. Mapped parameters cannot wrap other mapped
//! parameters, so value resolution is never recursive beyond one level.

pub mod envelope;

pub use envelope::{CurveType, Envelope, EnvelopeSegment};

use crate::error::{PetalScapeError, Result};
use crate::handle::{Handle, HandleAllocator, Registry};
use std::collections::HashMap;

/// Per-instance parameter values keyed by parameter handle.
pub type ParameterValues = HashMap<Handle, ParameterValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Int,
    Double,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Int(i64),
    Double(f64),
    Str(String),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            Self::Int(_) => ParameterKind::Int,
            Self::Double(_) => ParameterKind::Double,
            Self::Str(_) => ParameterKind::String,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Label used by switch nodes. Integers are rendered in decimal.
    pub fn as_label(&self) -> Option<String> {
        match self {
            Self::Str(s) => Some(s.clone()),
            Self::Int(v) => Some(v.to_string()),
            Self::Double(_) => None,
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Typed parameter template.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaParameter {
    name: String,
    default: ParameterValue,
    range: Option<(f64, f64)>,
}

impl MetaParameter {
    pub fn int(name: &str, default: i64, min: i64, max: i64) -> Result<Self> {
        Self::numeric(name, ParameterValue::Int(default), min as f64, max as f64)
    }

    pub fn double(name: &str, default: f64, min: f64, max: f64) -> Result<Self> {
        Self::numeric(name, ParameterValue::Double(default), min, max)
    }

    pub fn string(name: &str, default: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            default: ParameterValue::Str(default.to_string()),
            range: None,
        })
    }

    fn numeric(name: &str, default: ParameterValue, min: f64, max: f64) -> Result<Self> {
        validate_name(name)?;
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(PetalScapeError::Validation(format!(
                "parameter '{}' has invalid range [{}, {}]",
                name, min, max
            )));
        }
        let mut parameter = Self {
            name: name.to_string(),
            default: default.clone(),
            range: Some((min, max)),
        };
        parameter.default = parameter.coerce(default)?;
        Ok(parameter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParameterKind {
        self.default.kind()
    }

    pub fn default_value(&self) -> &ParameterValue {
        &self.default
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.range
    }

    /// Type-checks `value` against this parameter and clamps numeric values.
    ///
    /// Int values are accepted for Double parameters.
    pub fn coerce(&self, value: ParameterValue) -> Result<ParameterValue> {
        let (min, max) = self.range.unwrap_or((f64::MIN, f64::MAX));
        match (self.kind(), value) {
            (ParameterKind::Int, ParameterValue::Int(v)) => {
                Ok(ParameterValue::Int(v.clamp(min as i64, max as i64)))
            }
            (ParameterKind::Double, ParameterValue::Double(v)) if !v.is_nan() => {
                Ok(ParameterValue::Double(v.clamp(min, max)))
            }
            (ParameterKind::Double, ParameterValue::Int(v)) => {
                Ok(ParameterValue::Double((v as f64).clamp(min, max)))
            }
            (ParameterKind::String, ParameterValue::Str(s)) => Ok(ParameterValue::Str(s)),
            (kind, value) => Err(PetalScapeError::ParameterType(format!(
                "parameter '{}' is {:?}, got {:?}",
                self.name, kind, value
            ))),
        }
    }

    pub(crate) fn set_default(&mut self, value: ParameterValue) -> Result<()> {
        self.default = self.coerce(value)?;
        Ok(())
    }
}

/// Parameter whose value is an envelope applied to another parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedMetaParameter {
    source: Handle,
    envelope: Envelope,
}

impl MappedMetaParameter {
    pub fn source(&self) -> Handle {
        self.source
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterEntry {
    Plain(MetaParameter),
    Mapped(MappedMetaParameter),
}

/// All parameter templates of an engine.
#[derive(Debug, Default)]
pub struct ParameterStore {
    entries: Registry<ParameterEntry>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, allocator: &HandleAllocator, parameter: MetaParameter) -> Result<Handle> {
        if self.find_by_name(parameter.name()).is_some() {
            return Err(PetalScapeError::AlreadyExists(format!(
                "parameter '{}'",
                parameter.name()
            )));
        }
        Ok(self.entries.insert(allocator, ParameterEntry::Plain(parameter)))
    }

    /// Creates a mapped parameter over a plain numeric parameter.
    pub fn create_mapped(
        &mut self,
        allocator: &HandleAllocator,
        source: Handle,
        envelope: Envelope,
    ) -> Result<Handle> {
        match self.entries.get(source)? {
            ParameterEntry::Plain(p) if p.kind() != ParameterKind::String => {}
            ParameterEntry::Plain(p) => {
                return Err(PetalScapeError::ParameterType(format!(
                    "mapped parameter source '{}' must be numeric",
                    p.name()
                )));
            }
            ParameterEntry::Mapped(_) => {
                return Err(PetalScapeError::Validation(
                    "mapped parameters can only wrap plain parameters".into(),
                ));
            }
        }
        Ok(self.entries.insert(
            allocator,
            ParameterEntry::Mapped(MappedMetaParameter { source, envelope }),
        ))
    }

    pub fn destroy(&mut self, handle: Handle) -> Result<()> {
        self.entries.remove(handle).map(|_| ())
    }

    pub fn entry(&self, handle: Handle) -> Result<&ParameterEntry> {
        self.entries.get(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains(handle)
    }

    /// Template of a plain parameter.
    pub fn plain(&self, handle: Handle) -> Result<&MetaParameter> {
        match self.entries.get(handle)? {
            ParameterEntry::Plain(p) => Ok(p),
            ParameterEntry::Mapped(_) => Err(PetalScapeError::ParameterType(format!(
                "{} is a mapped parameter",
                handle
            ))),
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<Handle> {
        self.entries.iter().find_map(|(handle, entry)| match entry {
            ParameterEntry::Plain(p) if p.name() == name => Some(handle),
            _ => None,
        })
    }

    /// Kind of the value the parameter produces. Mapped parameters are Double.
    pub fn value_kind(&self, handle: Handle) -> Result<ParameterKind> {
        Ok(match self.entries.get(handle)? {
            ParameterEntry::Plain(p) => p.kind(),
            ParameterEntry::Mapped(_) => ParameterKind::Double,
        })
    }

    /// Updates the template default (the value seen outside any instance).
    pub fn set_default(&mut self, handle: Handle, value: ParameterValue) -> Result<()> {
        match self.entries.get_mut(handle)? {
            ParameterEntry::Plain(p) => p.set_default(value),
            ParameterEntry::Mapped(_) => Err(PetalScapeError::ParameterType(
                "mapped parameters are derived and cannot be set".into(),
            )),
        }
    }

    /// Validates and clamps a value for storage in an instance's private copy.
    pub fn coerce(&self, handle: Handle, value: ParameterValue) -> Result<ParameterValue> {
        match self.entries.get(handle)? {
            ParameterEntry::Plain(p) => p.coerce(value),
            ParameterEntry::Mapped(_) => Err(PetalScapeError::ParameterType(
                "mapped parameters are derived and cannot be set".into(),
            )),
        }
    }

    /// Current value of a parameter as seen through `overrides`.
    ///
    /// Pass an empty map for the global (template) view.
    pub fn value(&self, handle: Handle, overrides: &ParameterValues) -> Result<ParameterValue> {
        match self.entries.get(handle)? {
            ParameterEntry::Plain(p) => Ok(overrides
                .get(&handle)
                .cloned()
                .unwrap_or_else(|| p.default_value().clone())),
            ParameterEntry::Mapped(mapped) => {
                let input = self
                    .value(mapped.source, overrides)?
                    .as_f64()
                    .ok_or_else(|| {
                        PetalScapeError::ParameterType("mapped source is not numeric".into())
                    })?;
                Ok(ParameterValue::Double(mapped.envelope.evaluate(input)))
            }
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        Err(PetalScapeError::Validation(
            "parameter name must not be empty".into(),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_values_clamped() {
        let parameter = MetaParameter::double("speed", 0.5, 0.0, 1.0).unwrap();
        assert_eq!(
            parameter.coerce(ParameterValue::Double(4.0)),
            Ok(ParameterValue::Double(1.0))
        );
        assert_eq!(
            parameter.coerce(ParameterValue::Int(-3)),
            Ok(ParameterValue::Double(0.0))
        );

        let count = MetaParameter::int("count", 50, 0, 10).unwrap();
        assert_eq!(count.default_value(), &ParameterValue::Int(10));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let parameter = MetaParameter::string("surface", "grass").unwrap();
        assert!(matches!(
            parameter.coerce(ParameterValue::Double(1.0)),
            Err(PetalScapeError::ParameterType(_))
        ));
        let numeric = MetaParameter::int("n", 0, 0, 1).unwrap();
        assert!(numeric.coerce(ParameterValue::Str("x".into())).is_err());
    }

    #[test]
    fn test_invalid_range_rejected() {
        assert!(MetaParameter::double("bad", 0.0, 1.0, 0.0).is_err());
        assert!(MetaParameter::double("", 0.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn test_instance_overrides_and_template_default() {
        let allocator = HandleAllocator::new();
        let mut store = ParameterStore::new();
        let handle = store
            .create(&allocator, MetaParameter::double("speed", 0.2, 0.0, 1.0).unwrap())
            .unwrap();

        let mut overrides = ParameterValues::new();
        overrides.insert(handle, store.coerce(handle, 0.9.into()).unwrap());

        assert_eq!(store.value(handle, &overrides), Ok(ParameterValue::Double(0.9)));
        assert_eq!(
            store.value(handle, &ParameterValues::new()),
            Ok(ParameterValue::Double(0.2))
        );

        store.set_default(handle, 2.0.into()).unwrap();
        assert_eq!(
            store.value(handle, &ParameterValues::new()),
            Ok(ParameterValue::Double(1.0))
        );
        assert_eq!(store.find_by_name("speed"), Some(handle));
    }

    #[test]
    fn test_mapped_parameter_follows_source() {
        let allocator = HandleAllocator::new();
        let mut store = ParameterStore::new();
        let source = store
            .create(&allocator, MetaParameter::double("distance", 0.0, 0.0, 100.0).unwrap())
            .unwrap();
        let envelope = Envelope::new(
            (0.0, 1.0),
            vec![EnvelopeSegment::new(100.0, 0.0, CurveType::Linear)],
        )
        .unwrap();
        let mapped = store.create_mapped(&allocator, source, envelope.clone()).unwrap();

        let mut overrides = ParameterValues::new();
        overrides.insert(source, ParameterValue::Double(25.0));
        assert_eq!(store.value(mapped, &overrides), Ok(ParameterValue::Double(0.75)));

        assert!(store.create_mapped(&allocator, mapped, envelope.clone()).is_err());
        assert!(store.set_default(mapped, 1.0.into()).is_err());

        let label = store
            .create(&allocator, MetaParameter::string("label", "a").unwrap())
            .unwrap();
        assert!(store.create_mapped(&allocator, label, envelope).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let allocator = HandleAllocator::new();
        let mut store = ParameterStore::new();
        store
            .create(&allocator, MetaParameter::string("surface", "grass").unwrap())
            .unwrap();
        assert!(matches!(
            store.create(&allocator, MetaParameter::string("surface", "wood").unwrap()),
            Err(PetalScapeError::AlreadyExists(_))
        ));
    }
}
