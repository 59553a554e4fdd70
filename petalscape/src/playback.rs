//! Playback instances and the render units they own.
//!
//! An instance is created by `play`, holds private copies of the parameters it
//! changes, and reports exactly once through its completion callback. Its
//! units are reconciled against every graph evaluation: units whose node path
//! is still produced keep playing, vanished ones are stopped, new ones are
//! started.

use crate::error::{PetalScapeError, Result};
use crate::graph::{CalibrationMode, UnitKind, UnitSpec};
use crate::handle::{Handle, HandleAllocator};
use crate::parameter::{ParameterValue, ParameterValues};
use crate::render::RenderInput;
use crate::stream::StreamReader;
use std::collections::{HashMap, HashSet};

/// Why an instance's completion callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionReason {
    /// The instance could not be resolved and never played
    Failure,
    /// Every unit ran to its end
    FinishedPlaying,
    /// Stopped explicitly or by the engine shutting down
    Terminated,
}

/// Invoked once with the reason, the source handle and the instance handle.
pub type CompletionCallback = Box<dyn FnOnce(CompletionReason, Handle, Handle) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    Playing,
    /// Stop requested, acknowledged on the next tick
    Stopping,
    Finished,
    Failed,
    Terminated,
}

impl PlaybackState {
    /// Reason reported when the engine shuts down with the instance in this state.
    pub fn shutdown_reason(&self) -> CompletionReason {
        match self {
            Self::Failed => CompletionReason::Failure,
            Self::Finished => CompletionReason::FinishedPlaying,
            Self::Playing | Self::Stopping | Self::Terminated => CompletionReason::Terminated,
        }
    }
}

/// Extra inputs for `play_with_options`.
#[derive(Debug, Default)]
pub struct PlayOptions {
    /// Instance-private parameter values applied before the first evaluation
    pub parameters: Vec<(Handle, ParameterValue)>,
    /// Readers for pull-stream nodes, keyed by stream name
    pub stream_readers: HashMap<String, StreamReader>,
}

impl PlayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, parameter: Handle, value: impl Into<ParameterValue>) -> Self {
        self.parameters.push((parameter, value.into()));
        self
    }

    pub fn with_stream_reader(mut self, stream: &str, reader: StreamReader) -> Self {
        self.stream_readers.insert(stream.to_string(), reader);
        self
    }
}

/// Outcome of advancing a unit by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitProgress {
    Playing,
    Looped(u32),
    Finished,
}

/// One playing leaf of an instance's graph.
#[derive(Debug)]
pub struct RenderUnit {
    pub(crate) handle: Handle,
    pub(crate) path: Vec<Handle>,
    pub(crate) mixer: Handle,
    pub(crate) rate_parameter: Option<Handle>,
    pub(crate) calibration: CalibrationMode,
    pub(crate) level: f64,
    pub(crate) blend_gain: f64,
    /// Frames in the asset; `None` for streams
    length_frames: Option<f64>,
    looping: bool,
    /// Asset frames consumed per engine frame at rate 1.0
    rate_scale: f64,
    position: f64,
    loop_count: u32,
    pub(crate) pending_input: Option<RenderInput>,
    /// Last gain and rate sent to the renderer
    pub(crate) reported: Option<(f32, f64)>,
}

impl RenderUnit {
    fn from_spec(handle: Handle, spec: UnitSpec, input: RenderInput, engine_sample_rate: u32) -> Self {
        let (length_frames, looping, rate_parameter, rate_scale) = match &spec.kind {
            UnitKind::Sample {
                buffer,
                looping,
                rate_parameter,
                ..
            } => (
                Some(buffer.total_frames() as f64),
                *looping,
                *rate_parameter,
                f64::from(buffer.sample_rate()) / f64::from(engine_sample_rate),
            ),
            UnitKind::Stream { .. } => (None, false, None, 1.0),
        };

        Self {
            handle,
            path: spec.path,
            mixer: spec.mixer,
            rate_parameter,
            calibration: spec.calibration,
            level: spec.level,
            blend_gain: spec.blend_gain,
            length_frames,
            looping,
            rate_scale,
            position: 0.0,
            loop_count: 0,
            pending_input: Some(input),
            reported: None,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn path(&self) -> &[Handle] {
        &self.path
    }

    pub fn mixer(&self) -> Handle {
        self.mixer
    }

    /// Position in asset frames.
    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn is_started(&self) -> bool {
        self.pending_input.is_none()
    }

    /// Moves the play head by `engine_frames` engine frames at `rate`.
    pub fn advance(&mut self, engine_frames: f64, rate: f64) -> UnitProgress {
        let Some(length) = self.length_frames else {
            return UnitProgress::Playing;
        };

        self.position += engine_frames * rate.max(0.0) * self.rate_scale;
        if self.position < length {
            return UnitProgress::Playing;
        }

        if self.looping && length > 0.0 {
            self.loop_count += (self.position / length) as u32;
            self.position %= length;
            UnitProgress::Looped(self.loop_count)
        } else if self.looping {
            UnitProgress::Playing
        } else {
            self.position = length;
            UnitProgress::Finished
        }
    }
}

/// Result of matching a fresh evaluation against the live units.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Units that are no longer produced and must be stopped
    pub removed: Vec<RenderUnit>,
    /// Streams that need a reader nobody supplied
    pub missing_streams: Vec<String>,
}

pub struct PlaybackInstance {
    handle: Handle,
    asset: String,
    root: Handle,
    source: Handle,
    pub(crate) mixers: Vec<Handle>,
    pub(crate) parameters: ParameterValues,
    pub(crate) random_choices: HashMap<Handle, Handle>,
    units: Vec<RenderUnit>,
    state: PlaybackState,
    callback: Option<CompletionCallback>,
    stream_readers: HashMap<String, StreamReader>,
    pub(crate) announced: bool,
    /// Paths of units that ran to their end. Never restarted by re-evaluation.
    finished_paths: HashSet<Vec<Handle>>,
    /// Set when `play` resolved no units; cleared after the first tick
    pub(crate) finish_if_empty: bool,
    /// Engine input generation this instance was last evaluated against
    pub(crate) evaluated_generation: u64,
    pub(crate) dirty: bool,
}

impl std::fmt::Debug for PlaybackInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackInstance")
            .field("handle", &self.handle)
            .field("asset", &self.asset)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("units", &self.units.len())
            .finish()
    }
}

impl PlaybackInstance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: Handle,
        asset: &str,
        root: Handle,
        source: Handle,
        mixers: Vec<Handle>,
        parameters: ParameterValues,
        stream_readers: HashMap<String, StreamReader>,
        callback: CompletionCallback,
    ) -> Self {
        Self {
            handle,
            asset: asset.to_string(),
            root,
            source,
            mixers,
            parameters,
            random_choices: HashMap::new(),
            units: Vec::new(),
            state: PlaybackState::Playing,
            callback: Some(callback),
            stream_readers,
            announced: false,
            finished_paths: HashSet::new(),
            finish_if_empty: false,
            evaluated_generation: 0,
            dirty: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn root(&self) -> Handle {
        self.root
    }

    pub fn source(&self) -> Handle {
        self.source
    }

    pub fn mixers(&self) -> &[Handle] {
        &self.mixers
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn units(&self) -> &[RenderUnit] {
        &self.units
    }

    pub(crate) fn units_mut(&mut self) -> &mut Vec<RenderUnit> {
        &mut self.units
    }

    /// Marks the instance as failed to resolve. It never reaches Playing.
    pub(crate) fn fail(&mut self) {
        self.units.clear();
        self.state = PlaybackState::Failed;
    }

    /// Playing -> Stopping. Repeated requests are accepted.
    pub fn request_stop(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => {
                self.state = PlaybackState::Stopping;
                Ok(())
            }
            PlaybackState::Stopping => Ok(()),
            other => Err(PetalScapeError::InvalidState(format!(
                "{} cannot be stopped while {:?}",
                self.handle, other
            ))),
        }
    }

    /// Moves to a final state and hands out the callback, once.
    pub(crate) fn complete(&mut self, state: PlaybackState) -> Option<CompletionCallback> {
        self.state = state;
        self.callback.take()
    }

    /// Drops units that ran to their end and remembers their paths.
    pub(crate) fn retire(&mut self, finished: &[Handle]) {
        let (done, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.units)
            .into_iter()
            .partition(|unit| finished.contains(&unit.handle));
        self.finished_paths.extend(done.into_iter().map(|unit| unit.path));
        self.units = live;
    }

    /// Name of the first stream unit in `specs` without a reader, if any.
    pub(crate) fn first_missing_stream(&self, specs: &[UnitSpec]) -> Option<String> {
        specs.iter().find_map(|spec| match &spec.kind {
            UnitKind::Stream { name, .. } if !self.stream_readers.contains_key(name) => {
                Some(name.clone())
            }
            _ => None,
        })
    }

    /// Replaces the unit set with `specs`, keeping units whose path survives.
    /// Specs for units that already finished are skipped.
    pub(crate) fn reconcile(
        &mut self,
        specs: Vec<UnitSpec>,
        allocator: &HandleAllocator,
        engine_sample_rate: u32,
    ) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        let mut previous: Vec<Option<RenderUnit>> =
            std::mem::take(&mut self.units).into_iter().map(Some).collect();

        for spec in specs {
            if self.finished_paths.contains(&spec.path) {
                continue;
            }
            let existing = previous
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|unit| unit.path == spec.path))
                .and_then(Option::take);

            if let Some(mut unit) = existing {
                unit.blend_gain = spec.blend_gain;
                self.units.push(unit);
                continue;
            }

            let input = match &spec.kind {
                UnitKind::Sample {
                    buffer, looping, ..
                } => RenderInput::Sample {
                    buffer: buffer.clone(),
                    looping: *looping,
                },
                UnitKind::Stream { name, .. } => match self.stream_readers.remove(name) {
                    Some(reader) => RenderInput::Stream(reader),
                    None => {
                        outcome.missing_streams.push(name.clone());
                        continue;
                    }
                },
            };
            self.units.push(RenderUnit::from_spec(
                allocator.allocate(),
                spec,
                input,
                engine_sample_rate,
            ));
        }

        outcome.removed = previous.into_iter().flatten().collect();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_asset::AudioBuffer;
    use std::sync::Arc;

    fn sample_spec(path: Vec<Handle>, frames: usize, sample_rate: u32, looping: bool) -> UnitSpec {
        UnitSpec {
            path,
            kind: UnitKind::Sample {
                asset: "click".into(),
                buffer: Arc::new(AudioBuffer::silence(frames, sample_rate).unwrap()),
                looping,
                rate_parameter: None,
            },
            mixer: Handle::from_raw(0),
            calibration: CalibrationMode::None,
            level: 1.0,
            blend_gain: 1.0,
        }
    }

    fn instance() -> PlaybackInstance {
        PlaybackInstance::new(
            Handle::from_raw(10),
            "tap",
            Handle::from_raw(1),
            Handle::from_raw(2),
            vec![Handle::from_raw(0)],
            ParameterValues::new(),
            HashMap::new(),
            Box::new(|_, _, _| {}),
        )
    }

    #[test]
    fn test_unit_finishes_after_length() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        instance.reconcile(
            vec![sample_spec(vec![Handle::from_raw(1)], 2500, 48000, false)],
            &allocator,
            48000,
        );
        let unit = &mut instance.units_mut()[0];

        assert_eq!(unit.advance(1024.0, 1.0), UnitProgress::Playing);
        assert_eq!(unit.advance(1024.0, 1.0), UnitProgress::Playing);
        assert_eq!(unit.advance(1024.0, 1.0), UnitProgress::Finished);
        assert_eq!(unit.position(), 2500.0);
    }

    #[test]
    fn test_rate_and_sample_rate_scale_advance() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        instance.reconcile(
            vec![sample_spec(vec![Handle::from_raw(1)], 48000, 24000, false)],
            &allocator,
            48000,
        );
        let unit = &mut instance.units_mut()[0];
        unit.advance(1000.0, 2.0);
        assert_eq!(unit.position(), 1000.0);
    }

    #[test]
    fn test_looping_unit_wraps() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        instance.reconcile(
            vec![sample_spec(vec![Handle::from_raw(1)], 1000, 48000, true)],
            &allocator,
            48000,
        );
        let unit = &mut instance.units_mut()[0];
        assert_eq!(unit.advance(600.0, 1.0), UnitProgress::Playing);
        assert_eq!(unit.advance(600.0, 1.0), UnitProgress::Looped(1));
        assert_eq!(unit.position(), 200.0);
    }

    #[test]
    fn test_reconcile_keeps_surviving_paths() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        let a = vec![Handle::from_raw(1), Handle::from_raw(2)];
        let b = vec![Handle::from_raw(1), Handle::from_raw(3)];
        let c = vec![Handle::from_raw(1), Handle::from_raw(4)];

        instance.reconcile(
            vec![
                sample_spec(a.clone(), 100, 48000, false),
                sample_spec(b.clone(), 100, 48000, false),
            ],
            &allocator,
            48000,
        );
        let kept = instance.units()[0].handle();

        let outcome = instance.reconcile(
            vec![
                sample_spec(a.clone(), 100, 48000, false),
                sample_spec(c.clone(), 100, 48000, false),
            ],
            &allocator,
            48000,
        );

        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].path(), &b[..]);
        assert_eq!(instance.units().len(), 2);
        assert_eq!(instance.units()[0].handle(), kept);
        assert_eq!(instance.units()[1].path(), &c[..]);
    }

    #[test]
    fn test_finished_paths_are_not_restarted() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        let short = vec![Handle::from_raw(1), Handle::from_raw(2)];
        let long = vec![Handle::from_raw(1), Handle::from_raw(3)];
        let specs = || {
            vec![
                sample_spec(short.clone(), 100, 48000, false),
                sample_spec(long.clone(), 48000, 48000, false),
            ]
        };

        instance.reconcile(specs(), &allocator, 48000);
        let done = instance.units()[0].handle();
        instance.retire(&[done]);
        assert_eq!(instance.units().len(), 1);

        let outcome = instance.reconcile(specs(), &allocator, 48000);
        assert!(outcome.removed.is_empty());
        assert_eq!(instance.units().len(), 1);
        assert_eq!(instance.units()[0].path(), &long[..]);
    }

    #[test]
    fn test_stream_without_reader_is_reported() {
        let allocator = HandleAllocator::new();
        let mut instance = instance();
        let spec = UnitSpec {
            path: vec![Handle::from_raw(5)],
            kind: UnitKind::Stream {
                name: "voice".into(),
                format: crate::stream::StreamFormat::default(),
            },
            mixer: Handle::from_raw(0),
            calibration: CalibrationMode::None,
            level: 1.0,
            blend_gain: 1.0,
        };
        assert_eq!(
            instance.first_missing_stream(std::slice::from_ref(&spec)),
            Some("voice".to_string())
        );
        let outcome = instance.reconcile(vec![spec], &allocator, 48000);
        assert_eq!(outcome.missing_streams, vec!["voice".to_string()]);
        assert!(instance.units().is_empty());
    }

    #[test]
    fn test_stop_transitions() {
        let mut instance = instance();
        assert!(instance.request_stop().is_ok());
        assert_eq!(instance.state(), PlaybackState::Stopping);
        assert!(instance.request_stop().is_ok());

        assert!(instance.complete(PlaybackState::Terminated).is_some());
        assert!(instance.complete(PlaybackState::Terminated).is_none());
        assert!(instance.request_stop().is_err());
    }
}
