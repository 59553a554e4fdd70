//! # PetalScape
//!
//! A handle-based spatial audio event engine.
//!
//! PetalScape keeps a 3D scene (listener, point and volumetric sources, occluders
//! with acoustic materials), a set of mixers and meta-parameters, and a graph of
//! sound-event nodes. Playing a registered event on a source resolves the graph
//! into render units and drives them every `update()` tick, reporting exactly
//! one completion per instance.
//!
//! ## Quick Start
//!
//! ```no_run
//! use petalscape::*;
//!
//! let engine = PetalScapeEngine::new(EngineDesc::default())?;
//! engine.start()?;
//! engine.create_listener()?;
//!
//! let mixer = engine.create_mixer("spatial", MixerKind::Spatial(SpatialMixerDesc::default()))?;
//! engine.register_audio_asset("click", AudioBuffer::silence(4800, 48000)?)?;
//! let click = engine.create_node(SoundEventNode::Sampler(SamplerNode::new("click", mixer)))?;
//! engine.register_event_asset("tap", click)?;
//!
//! let source = engine.create_source();
//! engine.play("tap", source, &[mixer], |reason, _source, instance| {
//!     println!("{} finished: {:?}", instance, reason);
//! })?;
//!
//! // Drive the engine from your frame or audio loop
//! engine.update();
//! # Ok::<(), PetalScapeError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`PetalScapeEngine`]**: Owns every entity and runs the tick
//! - **[`SoundEventNode`]**: Sampler, pull-stream, switch, random, blend and container nodes
//! - **[`MetaParameter`]**: Int, double and string parameters, plus envelope-mapped ones
//! - **[`RenderSink`]**: Receives start/update/stop commands for each render unit
//! - **[`StreamingRingBuffer`]**: Lock-free PCM transfer for pull-stream nodes
//! - **[`PetalScapeEvent`]**: Lifecycle and diagnostics events
//!
//! ## Threading
//!
//! Control calls and `update()` share one lock. `update()` never waits for it:
//! when a control call holds the engine, the tick is skipped. Completion
//! callbacks run on the thread calling `update()` (or `stop()`), outside the
//! lock, and may call back into the engine.

pub mod audio_asset;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod handle;
pub mod math;
pub mod mixer;
pub mod parameter;
pub mod playback;
pub mod render;
pub mod scene;
pub mod stream;

pub use audio_asset::{AudioAssetTable, AudioBuffer};
pub use config::EngineDesc;
pub use engine::{EngineState, PetalScapeEngine};
pub use error::{PetalScapeError, Result};
pub use events::PetalScapeEvent;
pub use graph::{
    BlendNode, BlendRange, CalibrationMode, PullStreamNode, RandomNode, SamplerNode,
    SoundEventNode, SwitchFallback, SwitchNode,
};
pub use handle::Handle;
pub use math::{Mat4, Pose, Quat, Vec3};
pub use mixer::{
    ChannelLayout, DirectivityModel, DirectivitySubband, DirectivityType, MixerKind,
    SpatialMixerDesc,
};
pub use parameter::{CurveType, Envelope, EnvelopeSegment, MetaParameter, ParameterValue};
pub use playback::{CompletionReason, PlayOptions, PlaybackState};
pub use render::{ChannelSink, NullSink, RenderCommand, RenderInput, RenderSink};
pub use scene::{AcousticMaterial, AcousticProperties, MaterialPreset, Mesh, ReverbPreset};
pub use stream::{StreamFormat, StreamReader, StreamWriter, StreamingRingBuffer};
