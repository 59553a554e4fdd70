use crate::error::{PetalScapeError, Result};
use crate::graph::SwitchFallback;

/// Configuration descriptor for a PetalScape engine
#[derive(Debug, Clone)]
pub struct EngineDesc {
    /// Sample rate the render units are advanced at
    pub sample_rate: u32,
    /// Number of frames a render unit advances per `update()` tick (at rate 1.0)
    pub block_size: usize,
    /// Number of output channels of the underlying renderer
    pub channels: u16,
    /// Maximum number of concurrently live playback instances
    pub max_instances: usize,
    /// Seed for random node selection (None seeds from entropy)
    pub random_seed: Option<u64>,
    /// Fallback policy for switch nodes created without an explicit one
    pub switch_fallback: SwitchFallback,
}

impl Default for EngineDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 1024,
            channels: 2,
            max_instances: 256,
            random_seed: None,
            switch_fallback: SwitchFallback::Silent,
        }
    }
}

impl EngineDesc {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PetalScapeError::Configuration(
                "sample_rate must be non-zero".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(PetalScapeError::Configuration(
                "block_size must be non-zero".into(),
            ));
        }
        if self.channels == 0 {
            return Err(PetalScapeError::Configuration(
                "channels must be non-zero".into(),
            ));
        }
        if self.max_instances == 0 {
            return Err(PetalScapeError::Configuration(
                "max_instances must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_desc_is_valid() {
        assert!(EngineDesc::default().validate().is_ok());
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let desc = EngineDesc {
            block_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            desc.validate(),
            Err(PetalScapeError::Configuration(_))
        ));
    }
}
