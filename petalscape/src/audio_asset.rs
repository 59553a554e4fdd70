//! Registered PCM buffers that sampler nodes play by name.

use crate::error::{PetalScapeError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Decoded audio handed over by the caller.
///
/// Samples are **interleaved**: `[L0, R0, L1, R1, ...]` for stereo, so the
/// total length is `total_frames * channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(PetalScapeError::Validation(format!(
                "audio buffer needs a non-zero sample rate and channel count, got {}Hz x {}",
                sample_rate, channels
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(PetalScapeError::Validation(format!(
                "{} samples do not divide into {}-channel frames",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Mono buffer of `frames` zero samples.
    pub fn silence(frames: usize, sample_rate: u32) -> Result<Self> {
        Self::new(vec![0.0; frames], sample_rate, 1)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn total_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_frames() as f64 / self.sample_rate as f64)
    }
}

/// Name to buffer table. Started render units hold their own `Arc`, so
/// unregistering never affects audio already playing.
#[derive(Debug, Default)]
pub struct AudioAssetTable {
    assets: HashMap<String, Arc<AudioBuffer>>,
}

impl AudioAssetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the name was new, false when it replaced a buffer.
    pub fn register(&mut self, name: &str, buffer: AudioBuffer) -> Result<bool> {
        if name.is_empty() {
            return Err(PetalScapeError::Validation(
                "audio asset name must not be empty".into(),
            ));
        }
        log::info!(
            "Registered audio asset '{}': {} frames, {}Hz, {} channels",
            name,
            buffer.total_frames(),
            buffer.sample_rate(),
            buffer.channels()
        );
        Ok(self
            .assets
            .insert(name.to_string(), Arc::new(buffer))
            .is_none())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<AudioBuffer>> {
        self.assets
            .remove(name)
            .ok_or_else(|| PetalScapeError::NotFound(format!("audio asset '{}'", name)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<AudioBuffer>> {
        self.assets.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
