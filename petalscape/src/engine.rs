//! The engine context: owns every entity and drives playback from `update()`.
//!
//! All control calls and the tick share one `parking_lot::Mutex`. `update()`
//! only ever `try_lock`s it, so a render context calling `update()` never
//! blocks behind the control side; a contended tick is skipped and reported as
//! [`PetalScapeEvent::TickSkipped`].
//!
//! Completion callbacks are queued on a channel while the lock is held and
//! invoked after it is released, so callbacks may call back into the engine.

use crate::audio_asset::{AudioAssetTable, AudioBuffer};
use crate::config::EngineDesc;
use crate::error::{PetalScapeError, Result};
use crate::events::PetalScapeEvent;
use crate::graph::{Evaluation, EvaluationInputs, Evaluator, NodeGraph, SoundEventNode};
use crate::handle::{Handle, HandleAllocator, Registry};
use crate::math::{Mat4, Pose, Vec3, clamp_unit};
use crate::mixer::{Mixer, MixerKind};
use crate::parameter::{
    Envelope, MetaParameter, ParameterKind, ParameterStore, ParameterValue, ParameterValues,
};
use crate::playback::{
    CompletionCallback, CompletionReason, PlayOptions, PlaybackInstance, PlaybackState,
    RenderUnit, UnitProgress,
};
use crate::render::{NullSink, RenderCommand, RenderSink};
use crate::scene::{
    AcousticMaterial, AcousticProperties, MaterialPreset, Mesh, ReverbPreset, Scene, SourceShape,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Stopped,
    Running,
    Paused,
}

/// Gain changes smaller than this are not sent to the renderer.
const GAIN_EPSILON: f32 = 1e-4;
const RATE_EPSILON: f64 = 1e-6;

struct PendingCompletion {
    callback: CompletionCallback,
    reason: CompletionReason,
    source: Handle,
    instance: Handle,
}

/// Spatial audio event engine.
///
/// `PetalScapeEngine` is `Send + Sync`; share it behind an `Arc` between the
/// thread issuing control calls and the one calling [`update`](Self::update).
pub struct PetalScapeEngine {
    desc: EngineDesc,
    allocator: HandleAllocator,
    core: Mutex<EngineCore>,
    completion_receiver: Receiver<PendingCompletion>,
    event_receiver: Receiver<PetalScapeEvent>,
    event_sender: Sender<PetalScapeEvent>,
}

struct EngineCore {
    desc: EngineDesc,
    state: EngineState,
    scene: Scene,
    mixers: Registry<Mixer>,
    parameters: ParameterStore,
    graph: NodeGraph,
    audio_assets: AudioAssetTable,
    instances: Registry<PlaybackInstance>,
    sink: Box<dyn RenderSink>,
    rng: ChaCha8Rng,
    /// Bumped whenever an input shared by all instances' graphs changes
    generation: u64,
    frames_rendered: u64,
    completion_sender: Sender<PendingCompletion>,
    event_sender: Sender<PetalScapeEvent>,
}

impl PetalScapeEngine {
    /// Creates a stopped engine.
    pub fn new(desc: EngineDesc) -> Result<Self> {
        desc.validate()?;

        let (completion_sender, completion_receiver) = crossbeam_channel::unbounded();
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();
        let rng = match desc.random_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        log::info!(
            "Creating PetalScape engine: {}Hz, block size {}, {} channels",
            desc.sample_rate,
            desc.block_size,
            desc.channels
        );

        Ok(Self {
            desc: desc.clone(),
            allocator: HandleAllocator::new(),
            core: Mutex::new(EngineCore {
                desc,
                state: EngineState::Stopped,
                scene: Scene::new(),
                mixers: Registry::new(),
                parameters: ParameterStore::new(),
                graph: NodeGraph::new(),
                audio_assets: AudioAssetTable::new(),
                instances: Registry::new(),
                sink: Box::new(NullSink),
                rng,
                generation: 0,
                frames_rendered: 0,
                completion_sender,
                event_sender: event_sender.clone(),
            }),
            completion_receiver,
            event_receiver,
            event_sender,
        })
    }

    pub fn config(&self) -> &EngineDesc {
        &self.desc
    }

    /// Installs the renderer that receives render commands from now on.
    pub fn set_render_sink(&self, sink: Box<dyn RenderSink>) {
        self.core.lock().sink = sink;
    }

    // ----- lifecycle -----

    pub fn state(&self) -> EngineState {
        self.core.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Stopped -> Running, or Paused -> Running.
    pub fn start(&self) -> Result<()> {
        let mut core = self.core.lock();
        match core.state {
            EngineState::Stopped => {
                core.state = EngineState::Running;
                core.send_event(PetalScapeEvent::EngineStarted);
                log::info!("Engine started");
                Ok(())
            }
            EngineState::Paused => {
                core.state = EngineState::Running;
                core.send_event(PetalScapeEvent::EngineResumed);
                log::info!("Engine resumed");
                Ok(())
            }
            EngineState::Running => Err(PetalScapeError::InvalidState(
                "engine is already running".into(),
            )),
        }
    }

    pub fn pause(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != EngineState::Running {
            return Err(PetalScapeError::InvalidState(format!(
                "cannot pause while {:?}",
                core.state
            )));
        }
        core.state = EngineState::Paused;
        core.send_event(PetalScapeEvent::EnginePaused);
        log::info!("Engine paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != EngineState::Paused {
            return Err(PetalScapeError::InvalidState(format!(
                "cannot resume while {:?}",
                core.state
            )));
        }
        core.state = EngineState::Running;
        core.send_event(PetalScapeEvent::EngineResumed);
        log::info!("Engine resumed");
        Ok(())
    }

    /// Running|Paused -> Stopped. Every live instance completes before this
    /// returns: pending failures report `Failure`, everything else `Terminated`.
    pub fn stop(&self) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.state == EngineState::Stopped {
                return Err(PetalScapeError::InvalidState(
                    "engine is already stopped".into(),
                ));
            }
            core.state = EngineState::Stopped;
            core.terminate_all();
            core.send_event(PetalScapeEvent::EngineStopped);
            log::info!("Engine stopped");
        }
        self.deliver_completions();
        Ok(())
    }

    /// Advances the engine by one block.
    ///
    /// Does nothing unless the engine is running. Never blocks: if a control
    /// call holds the engine, the tick is skipped.
    pub fn update(&self) {
        let Some(mut core) = self.core.try_lock() else {
            log::debug!("Engine busy, skipping tick");
            let _ = self.event_sender.send(PetalScapeEvent::TickSkipped);
            return;
        };
        if core.state == EngineState::Running {
            core.tick(&self.allocator);
        }
        drop(core);
        self.deliver_completions();
    }

    /// Drains all events emitted since the last poll.
    pub fn poll_events(&self) -> Vec<PetalScapeEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// Engine frames advanced since creation.
    pub fn frames_rendered(&self) -> u64 {
        self.core.lock().frames_rendered
    }

    fn deliver_completions(&self) {
        for completion in self.completion_receiver.try_iter() {
            log::debug!(
                "Delivering {:?} for instance {}",
                completion.reason,
                completion.instance
            );
            (completion.callback)(completion.reason, completion.source, completion.instance);
        }
    }

    // ----- listener -----

    pub fn create_listener(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.scene.create_listener()?;
        core.generation += 1;
        log::info!("Created listener");
        Ok(())
    }

    pub fn destroy_listener(&self) -> Result<()> {
        let mut core = self.core.lock();
        core.scene.destroy_listener()?;
        core.generation += 1;
        Ok(())
    }

    pub fn set_listener_transform(&self, transform: Mat4) -> Result<()> {
        let mut core = self.core.lock();
        core.scene.set_listener_transform(transform)?;
        core.generation += 1;
        Ok(())
    }

    pub fn listener_gain(&self) -> Result<f64> {
        let core = self.core.lock();
        core.scene
            .listener()
            .map(|l| l.gain())
            .ok_or_else(|| PetalScapeError::NotFound("listener".into()))
    }

    /// Sets the listener gain, clamped to [0, 1].
    pub fn set_listener_gain(&self, gain: f64) -> Result<()> {
        self.core.lock().scene.listener_mut()?.set_gain(gain);
        Ok(())
    }

    pub fn listener_head_tracking(&self) -> Result<bool> {
        let core = self.core.lock();
        core.scene
            .listener()
            .map(|l| l.head_tracking())
            .ok_or_else(|| PetalScapeError::NotFound("listener".into()))
    }

    pub fn set_listener_head_tracking(&self, enabled: bool) -> Result<()> {
        self.core
            .lock()
            .scene
            .listener_mut()?
            .set_head_tracking(enabled);
        Ok(())
    }

    // ----- sources -----

    pub fn create_source(&self) -> Handle {
        let mut core = self.core.lock();
        let handle = core.scene.create_source(&self.allocator, SourceShape::Point);
        log::info!("Created point source {}", handle);
        handle
    }

    /// Creates a source emitting from a mesh. The mesh data is copied.
    pub fn create_volumetric_source(
        &self,
        positions: &[Vec3],
        normals: &[Vec3],
        indices: &[u32],
    ) -> Result<Handle> {
        let mesh = Mesh::new(positions, normals, indices)?;
        let mut core = self.core.lock();
        let handle = core
            .scene
            .create_source(&self.allocator, SourceShape::Volumetric(mesh));
        log::info!("Created volumetric source {}", handle);
        Ok(handle)
    }

    /// Destroys a source. Instances still playing on it are stopped on the
    /// next tick.
    pub fn destroy_source(&self, source: Handle) -> Result<()> {
        let mut core = self.core.lock();
        core.scene.destroy_source(source)?;
        for (_, instance) in core.instances.iter_mut() {
            if instance.source() == source && instance.state() == PlaybackState::Playing {
                instance.request_stop()?;
            }
        }
        log::info!("Destroyed source {}", source);
        Ok(())
    }

    pub fn set_source_transform(&self, source: Handle, transform: Mat4) -> Result<()> {
        let mut core = self.core.lock();
        core.scene.set_source_transform(source, transform)?;
        core.generation += 1;
        Ok(())
    }

    pub fn source_gain(&self, source: Handle) -> Result<f64> {
        Ok(self.core.lock().scene.source(source)?.gain())
    }

    /// Sets a source's gain, clamped to [0, 1].
    pub fn set_source_gain(&self, source: Handle, gain: f64) -> Result<()> {
        self.core.lock().scene.source_mut(source)?.set_gain(gain);
        Ok(())
    }

    // ----- occluders & materials -----

    pub fn create_occluder(
        &self,
        positions: &[Vec3],
        normals: &[Vec3],
        indices: &[u32],
    ) -> Result<Handle> {
        let mesh = Mesh::new(positions, normals, indices)?;
        let mut core = self.core.lock();
        let handle = core.scene.create_occluder(&self.allocator, mesh);
        log::info!("Created occluder {}", handle);
        Ok(handle)
    }

    pub fn destroy_occluder(&self, occluder: Handle) -> Result<()> {
        self.core.lock().scene.destroy_occluder(occluder)?;
        Ok(())
    }

    pub fn set_occluder_transform(&self, occluder: Handle, transform: Mat4) -> Result<()> {
        self.core
            .lock()
            .scene
            .set_occluder_transform(occluder, transform)
    }

    pub fn set_occluder_material(&self, occluder: Handle, material: &str) -> Result<()> {
        self.core
            .lock()
            .scene
            .set_occluder_material(occluder, material)
    }

    /// The occluder's material as currently resolved by name.
    pub fn occluder_acoustics(&self, occluder: Handle) -> Result<Option<AcousticMaterial>> {
        self.core.lock().scene.occluder_acoustics(occluder)
    }

    /// Defines (or redefines) a material from a preset.
    pub fn create_material(&self, name: &str, preset: MaterialPreset) -> Result<()> {
        self.define_material(name, AcousticMaterial::from_preset(preset))
    }

    /// Defines (or redefines) a material from scale/shift/tilt properties.
    pub fn create_material_from_properties(
        &self,
        name: &str,
        properties: AcousticProperties,
    ) -> Result<()> {
        self.define_material(name, AcousticMaterial::from_properties(properties)?)
    }

    fn define_material(&self, name: &str, material: AcousticMaterial) -> Result<()> {
        let created = self.core.lock().scene.define_material(name, material)?;
        if created {
            log::info!("Created material '{}'", name);
        } else {
            log::info!("Redefined material '{}'", name);
        }
        Ok(())
    }

    /// Removes a material. Occluders using it become materialless.
    pub fn destroy_material(&self, name: &str) -> Result<()> {
        self.core.lock().scene.destroy_material(name)
    }

    pub fn reverb_preset(&self) -> ReverbPreset {
        self.core.lock().scene.reverb_preset()
    }

    pub fn set_reverb_preset(&self, preset: ReverbPreset) {
        log::info!("Scene reverb preset set to {:?}", preset);
        self.core.lock().scene.set_reverb_preset(preset);
    }

    // ----- mixers -----

    pub fn create_mixer(&self, name: &str, kind: MixerKind) -> Result<Handle> {
        let mixer = Mixer::new(name, kind)?;
        let mut core = self.core.lock();
        let handle = core.mixers.insert(&self.allocator, mixer);
        log::info!("Created mixer '{}' {}", name, handle);
        Ok(handle)
    }

    /// Destroys a mixer. Samplers referencing it fail when next resolved.
    pub fn destroy_mixer(&self, mixer: Handle) -> Result<()> {
        let mut core = self.core.lock();
        core.mixers.remove(mixer)?;
        core.generation += 1;
        Ok(())
    }

    /// Binds a numeric parameter whose value, clamped to [0, 1], scales every
    /// unit on `mixer`. [`Handle::INVALID`] unbinds.
    pub fn set_mixer_gain_parameter(&self, parameter: Handle, mixer: Handle) -> Result<()> {
        let mut core = self.core.lock();
        let binding = if parameter.is_valid() {
            if core.parameters.value_kind(parameter)? == ParameterKind::String {
                return Err(PetalScapeError::ParameterType(
                    "mixer gain parameter must be numeric".into(),
                ));
            }
            Some(parameter)
        } else {
            None
        };
        core.mixers.get_mut(mixer)?.gain_parameter = binding;
        Ok(())
    }

    // ----- parameters -----

    pub fn create_parameter(&self, parameter: MetaParameter) -> Result<Handle> {
        let mut core = self.core.lock();
        let name = parameter.name().to_string();
        let handle = core.parameters.create(&self.allocator, parameter)?;
        log::info!("Created meta-parameter '{}' {}", name, handle);
        Ok(handle)
    }

    /// Creates a parameter whose value is `envelope` applied to `source`.
    pub fn create_mapped_parameter(&self, source: Handle, envelope: Envelope) -> Result<Handle> {
        let mut core = self.core.lock();
        core.parameters
            .create_mapped(&self.allocator, source, envelope)
    }

    pub fn destroy_parameter(&self, parameter: Handle) -> Result<()> {
        let mut core = self.core.lock();
        core.parameters.destroy(parameter)?;
        core.generation += 1;
        Ok(())
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<Handle> {
        self.core.lock().parameters.find_by_name(name)
    }

    /// Current value, seen from `instance` or from the template when `None`.
    pub fn parameter_value(
        &self,
        parameter: Handle,
        instance: Option<Handle>,
    ) -> Result<ParameterValue> {
        let core = self.core.lock();
        match instance {
            Some(instance) => {
                let overrides = &core.instances.get(instance)?.parameters;
                core.parameters.value(parameter, overrides)
            }
            None => core
                .parameters
                .value(parameter, &ParameterValues::new()),
        }
    }

    /// Sets a value on `instance`'s private copy, or the template default when
    /// `None`. Numeric values are clamped to the parameter's range.
    pub fn set_parameter_value(
        &self,
        parameter: Handle,
        value: impl Into<ParameterValue>,
        instance: Option<Handle>,
    ) -> Result<()> {
        let mut core = self.core.lock();
        let value = value.into();
        match instance {
            Some(instance) => {
                let value = core.parameters.coerce(parameter, value)?;
                let instance = core.instances.get_mut(instance)?;
                instance.parameters.insert(parameter, value);
                instance.dirty = true;
            }
            None => {
                core.parameters.set_default(parameter, value)?;
                core.generation += 1;
            }
        }
        Ok(())
    }

    // ----- sound-event graph -----

    /// Creates a node. Children, mixers and parameters it names must exist.
    pub fn create_node(&self, node: SoundEventNode) -> Result<Handle> {
        let mut core = self.core.lock();
        core.check_node_references(&node)?;
        core.graph.create(&self.allocator, node)
    }

    /// Replaces a node's definition in place. Rejected if it would close a cycle.
    pub fn redefine_node(&self, handle: Handle, node: SoundEventNode) -> Result<()> {
        let mut core = self.core.lock();
        core.check_node_references(&node)?;
        core.graph.redefine(handle, node)?;
        core.generation += 1;
        Ok(())
    }

    /// Destroys a node. Units already resolved through it keep playing.
    pub fn destroy_node(&self, handle: Handle) -> Result<()> {
        let mut core = self.core.lock();
        core.graph.destroy(handle)?;
        core.generation += 1;
        log::debug!("Destroyed node {}", handle);
        Ok(())
    }

    pub fn register_event_asset(&self, name: &str, root: Handle) -> Result<()> {
        self.core.lock().graph.register_asset(name, root)?;
        Ok(())
    }

    /// Removes an event asset. Its nodes are left intact.
    pub fn unregister_event_asset(&self, name: &str) -> Result<()> {
        self.core.lock().graph.unregister_asset(name)?;
        log::info!("Unregistered event asset '{}'", name);
        Ok(())
    }

    pub fn has_event_asset(&self, name: &str) -> bool {
        self.core.lock().graph.asset_root(name).is_some()
    }

    // ----- audio assets -----

    pub fn register_audio_asset(&self, name: &str, buffer: AudioBuffer) -> Result<()> {
        let mut core = self.core.lock();
        core.audio_assets.register(name, buffer)?;
        core.generation += 1;
        Ok(())
    }

    /// Removes an audio asset. Units already playing it are unaffected.
    pub fn unregister_audio_asset(&self, name: &str) -> Result<()> {
        let mut core = self.core.lock();
        core.audio_assets.unregister(name)?;
        core.generation += 1;
        log::info!("Unregistered audio asset '{}'", name);
        Ok(())
    }

    // ----- playback -----

    /// Plays the named event on `source`, routing through `mixers`.
    ///
    /// Returns the instance handle. If the graph cannot be resolved the
    /// instance is created in the Failed state and `callback` receives
    /// `Failure` on the next tick.
    pub fn play<F>(&self, asset: &str, source: Handle, mixers: &[Handle], callback: F) -> Result<Handle>
    where
        F: FnOnce(CompletionReason, Handle, Handle) + Send + 'static,
    {
        self.play_with_options(asset, source, mixers, PlayOptions::default(), callback)
    }

    /// [`play`](Self::play) with initial instance parameters and stream readers.
    pub fn play_with_options<F>(
        &self,
        asset: &str,
        source: Handle,
        mixers: &[Handle],
        options: PlayOptions,
        callback: F,
    ) -> Result<Handle>
    where
        F: FnOnce(CompletionReason, Handle, Handle) + Send + 'static,
    {
        let mut core = self.core.lock();
        if core.state == EngineState::Stopped {
            return Err(PetalScapeError::EngineNotRunning);
        }
        core.scene.source(source)?;
        if core.instances.len() >= core.desc.max_instances {
            return Err(PetalScapeError::InvalidState(format!(
                "instance limit of {} reached",
                core.desc.max_instances
            )));
        }

        let mut parameters = ParameterValues::new();
        for (parameter, value) in options.parameters {
            let value = core.parameters.coerce(parameter, value)?;
            parameters.insert(parameter, value);
        }

        let root = core.graph.asset_root(asset);
        let generation = core.generation;
        let instance = core.instances.insert_with(&self.allocator, |handle| {
            PlaybackInstance::new(
                handle,
                asset,
                root.unwrap_or(Handle::INVALID),
                source,
                mixers.to_vec(),
                parameters,
                options.stream_readers,
                Box::new(callback),
            )
        });

        let resolution = match root {
            Some(_) => core.evaluate(instance),
            None => Err(PetalScapeError::NotFound(format!("event asset '{}'", asset))),
        };
        match resolution {
            Ok(evaluation) => core.apply_initial_evaluation(instance, evaluation, &self.allocator)?,
            Err(error) => core.fail_instance(instance, &error)?,
        }
        core.instances.get_mut(instance)?.evaluated_generation = generation;

        log::debug!("Playing '{}' on source {} as instance {}", asset, source, instance);
        Ok(instance)
    }

    /// Requests a stop. The instance reports `Terminated` on the next tick.
    pub fn stop_instance(&self, instance: Handle) -> Result<()> {
        self.core.lock().instances.get_mut(instance)?.request_stop()
    }

    pub fn instance_state(&self, instance: Handle) -> Result<PlaybackState> {
        Ok(self.core.lock().instances.get(instance)?.state())
    }

    /// Number of units an instance currently has.
    pub fn instance_unit_count(&self, instance: Handle) -> Result<usize> {
        Ok(self.core.lock().instances.get(instance)?.units().len())
    }

    pub fn live_instance_count(&self) -> usize {
        self.core.lock().instances.len()
    }
}

impl Drop for PetalScapeEngine {
    fn drop(&mut self) {
        if self.core.get_mut().state != EngineState::Stopped {
            let _ = self.stop();
        }
    }
}

impl EngineCore {
    fn send_event(&self, event: PetalScapeEvent) {
        let _ = self.event_sender.send(event);
    }

    fn emit(&mut self, command: RenderCommand) {
        if let Err(error) = self.sink.submit(command) {
            log::error!("Render sink rejected command: {}", error);
            self.send_event(PetalScapeEvent::RenderSinkError {
                error: error.to_string(),
            });
        }
    }

    fn check_node_references(&self, node: &SoundEventNode) -> Result<()> {
        let numeric = |parameter: Handle| -> Result<()> {
            match self.parameters.value_kind(parameter)? {
                ParameterKind::String => Err(PetalScapeError::ParameterType(format!(
                    "{} must be a numeric parameter",
                    parameter
                ))),
                _ => Ok(()),
            }
        };

        match node {
            SoundEventNode::Sampler(sampler) => {
                self.mixers.get(sampler.mixer)?;
                if let Some(rate) = sampler.rate_parameter {
                    numeric(rate)?;
                }
            }
            SoundEventNode::PullStream(stream) => {
                self.mixers.get(stream.mixer)?;
            }
            SoundEventNode::Switch(switch) => {
                if self.parameters.value_kind(switch.parameter)? == ParameterKind::Double {
                    return Err(PetalScapeError::ParameterType(
                        "switch parameter must be a string or integer".into(),
                    ));
                }
            }
            SoundEventNode::Blend(blend) => {
                if !blend.auto_distance {
                    if let Some(parameter) = blend.parameter {
                        numeric(parameter)?;
                    }
                }
            }
            SoundEventNode::Random(_) | SoundEventNode::Container(_) => {}
        }
        Ok(())
    }

    /// Evaluates an instance's graph from its root under current inputs.
    fn evaluate(&mut self, handle: Handle) -> Result<Evaluation> {
        let Self {
            desc,
            scene,
            mixers,
            parameters,
            graph,
            audio_assets,
            instances,
            rng,
            ..
        } = self;

        let instance = instances.get_mut(handle)?;
        let root = instance.root();
        let source_distance = scene
            .listener_source_distance(instance.source())
            .unwrap_or(0.0);
        let inputs = EvaluationInputs {
            parameters,
            overrides: &instance.parameters,
            mixers,
            allowed_mixers: &instance.mixers,
            audio_assets,
            source_distance,
            default_fallback: &desc.switch_fallback,
        };
        Evaluator::new(graph, inputs, &mut instance.random_choices, rng).evaluate(root)
    }

    fn apply_initial_evaluation(
        &mut self,
        handle: Handle,
        evaluation: Evaluation,
        allocator: &HandleAllocator,
    ) -> Result<()> {
        let missing = self
            .instances
            .get(handle)?
            .first_missing_stream(&evaluation.units);
        if let Some(stream) = missing {
            let error = PetalScapeError::NotFound(format!("stream reader for '{}'", stream));
            return self.fail_instance(handle, &error);
        }

        self.report_unmatched_switches(handle, &evaluation);
        let sample_rate = self.desc.sample_rate;
        let instance = self.instances.get_mut(handle)?;
        instance.finish_if_empty = evaluation.units.is_empty();
        instance.reconcile(evaluation.units, allocator, sample_rate);
        Ok(())
    }

    fn fail_instance(&mut self, handle: Handle, error: &PetalScapeError) -> Result<()> {
        let instance = self.instances.get_mut(handle)?;
        instance.fail();
        let source = instance.source();
        log::warn!("Instance {} failed to resolve: {}", handle, error);
        self.send_event(PetalScapeEvent::ResolutionFailed {
            instance: handle,
            source,
            reason: error.to_string(),
        });
        Ok(())
    }

    fn report_unmatched_switches(&self, instance: Handle, evaluation: &Evaluation) {
        for (node, label) in &evaluation.unmatched_switches {
            log::warn!(
                "Switch {} matched nothing for '{}' in instance {}",
                node,
                label,
                instance
            );
            self.send_event(PetalScapeEvent::SwitchUnmatched {
                instance,
                node: *node,
                label: label.clone(),
            });
        }
    }

    /// Removes the instance and queues its completion.
    fn complete(&mut self, handle: Handle, state: PlaybackState, reason: CompletionReason) {
        let Ok(mut instance) = self.instances.remove(handle) else {
            return;
        };
        let source = instance.source();
        if let Some(callback) = instance.complete(state) {
            let _ = self.completion_sender.send(PendingCompletion {
                callback,
                reason,
                source,
                instance: handle,
            });
        }
        log::debug!("Instance {} completed: {:?}", handle, reason);
        self.send_event(PetalScapeEvent::InstanceCompleted {
            instance: handle,
            source,
            reason,
        });
    }

    fn stop_started_units(&mut self, handle: Handle) {
        let started: Vec<Handle> = match self.instances.get(handle) {
            Ok(instance) => instance
                .units()
                .iter()
                .filter(|unit| unit.is_started())
                .map(|unit| unit.handle())
                .collect(),
            Err(_) => return,
        };
        for unit in started {
            self.emit(RenderCommand::Stop { unit });
        }
    }

    fn terminate_all(&mut self) {
        let mut handles: Vec<Handle> = self.instances.handles().collect();
        handles.sort();
        for handle in handles {
            let Ok(state) = self.instances.get(handle).map(|i| i.state()) else {
                continue;
            };
            self.stop_started_units(handle);
            let final_state = match state {
                PlaybackState::Failed => PlaybackState::Failed,
                _ => PlaybackState::Terminated,
            };
            self.complete(handle, final_state, state.shutdown_reason());
        }
    }

    fn tick(&mut self, allocator: &HandleAllocator) {
        let mut handles: Vec<Handle> = self.instances.handles().collect();
        handles.sort();

        for handle in handles {
            let Ok(state) = self.instances.get(handle).map(|i| i.state()) else {
                continue;
            };
            match state {
                PlaybackState::Failed => {
                    self.complete(handle, PlaybackState::Failed, CompletionReason::Failure);
                }
                PlaybackState::Stopping => {
                    self.stop_started_units(handle);
                    self.complete(handle, PlaybackState::Terminated, CompletionReason::Terminated);
                }
                PlaybackState::Playing => self.tick_instance(handle, allocator),
                PlaybackState::Finished | PlaybackState::Terminated => {}
            }
        }

        self.frames_rendered += self.desc.block_size as u64;
    }

    fn tick_instance(&mut self, handle: Handle, allocator: &HandleAllocator) {
        self.refresh(handle, allocator);

        let Ok(instance) = self.instances.get(handle) else {
            return;
        };
        let levels: Vec<(f32, f64)> = instance
            .units()
            .iter()
            .map(|unit| self.unit_levels(instance, unit))
            .collect();

        let block = self.desc.block_size as f64;
        let mut commands = Vec::new();
        let mut events = Vec::new();
        let Ok(instance) = self.instances.get_mut(handle) else {
            return;
        };
        let source = instance.source();

        if !instance.announced {
            instance.announced = true;
            events.push(PetalScapeEvent::InstanceStarted {
                instance: handle,
                source,
            });
        }

        let mut finished = Vec::new();
        for (unit, (gain, rate)) in instance.units_mut().iter_mut().zip(levels) {
            if let Some(input) = unit.pending_input.take() {
                commands.push(RenderCommand::Start {
                    unit: unit.handle,
                    instance: handle,
                    source,
                    mixer: unit.mixer,
                    input,
                    calibration: unit.calibration,
                    level: unit.level,
                    gain,
                    rate,
                });
                unit.reported = Some((gain, rate));
            } else if unit.reported.is_none_or(|(last_gain, last_rate)| {
                (last_gain - gain).abs() > GAIN_EPSILON || (last_rate - rate).abs() > RATE_EPSILON
            }) {
                commands.push(RenderCommand::Update {
                    unit: unit.handle,
                    gain,
                    rate,
                });
                unit.reported = Some((gain, rate));
            }

            match unit.advance(block, rate) {
                UnitProgress::Playing => {}
                UnitProgress::Looped(loop_count) => events.push(PetalScapeEvent::UnitLooped {
                    instance: handle,
                    unit: unit.handle,
                    loop_count,
                }),
                UnitProgress::Finished => {
                    commands.push(RenderCommand::Stop { unit: unit.handle });
                    finished.push(unit.handle);
                }
            }
        }
        instance.retire(&finished);
        // Units removed by re-evaluation did not finish; only a natural end
        // or an empty resolution at play time completes the instance.
        let done =
            instance.units().is_empty() && (!finished.is_empty() || instance.finish_if_empty);
        instance.finish_if_empty = false;

        for command in commands {
            self.emit(command);
        }
        for event in events {
            self.send_event(event);
        }
        if done {
            self.complete(handle, PlaybackState::Finished, CompletionReason::FinishedPlaying);
        }
    }

    /// Re-evaluates the instance if anything it depends on changed.
    ///
    /// A failed re-evaluation (for example a destroyed node) keeps the units
    /// already resolved.
    fn refresh(&mut self, handle: Handle, allocator: &HandleAllocator) {
        let generation = self.generation;
        let needs_refresh = match self.instances.get(handle) {
            Ok(instance) => instance.dirty || instance.evaluated_generation != generation,
            Err(_) => return,
        };
        if !needs_refresh {
            return;
        }

        match self.evaluate(handle) {
            Ok(evaluation) => {
                self.report_unmatched_switches(handle, &evaluation);
                let sample_rate = self.desc.sample_rate;
                let Ok(instance) = self.instances.get_mut(handle) else {
                    return;
                };
                let outcome = instance.reconcile(evaluation.units, allocator, sample_rate);
                for unit in outcome.removed {
                    if unit.is_started() {
                        self.emit(RenderCommand::Stop { unit: unit.handle() });
                    }
                }
                for stream in outcome.missing_streams {
                    log::warn!("No reader left for stream '{}' in instance {}", stream, handle);
                    self.send_event(PetalScapeEvent::StreamUnavailable {
                        instance: handle,
                        stream,
                    });
                }
            }
            Err(error) => {
                log::debug!(
                    "Instance {} keeps its units, re-evaluation failed: {}",
                    handle,
                    error
                );
            }
        }

        if let Ok(instance) = self.instances.get_mut(handle) {
            instance.dirty = false;
            instance.evaluated_generation = generation;
        }
    }

    /// Linear gain and playback rate for a unit under the current scene.
    fn unit_levels(&self, instance: &PlaybackInstance, unit: &RenderUnit) -> (f32, f64) {
        let overrides = &instance.parameters;
        let numeric = |parameter: Handle| {
            self.parameters
                .value(parameter, overrides)
                .ok()
                .and_then(|value| value.as_f64())
        };

        let rate = unit
            .rate_parameter
            .and_then(numeric)
            .map_or(1.0, |rate| rate.max(0.0));

        let (source_pose, source_gain) = match self.scene.source(instance.source()) {
            Ok(source) => (source.pose(), source.gain()),
            Err(_) => return (0.0, rate),
        };
        let (listener_pose, listener_gain) = self
            .scene
            .listener()
            .map_or((Pose::identity(), 1.0), |l| (l.pose(), l.gain()));

        let mut gain = source_gain * listener_gain * unit.blend_gain;
        if let Ok(mixer) = self.mixers.get(unit.mixer) {
            gain *= f64::from(mixer.spatial_gain(&source_pose, &listener_pose));
            if let MixerKind::Spatial(desc) = &mixer.kind {
                if desc.enable_direct_path {
                    gain *= f64::from(
                        self.scene
                            .occlusion_factor(listener_pose.position, source_pose.position),
                    );
                }
            }
            if let Some(parameter) = mixer.gain_parameter {
                gain *= numeric(parameter).map_or(1.0, clamp_unit);
            }
        }

        (gain as f32, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SamplerNode;
    use crate::mixer::{ChannelLayout, SpatialMixerDesc};
    use crate::render::ChannelSink;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn running_engine() -> PetalScapeEngine {
        let engine = PetalScapeEngine::new(EngineDesc {
            random_seed: Some(1),
            ..Default::default()
        })
        .unwrap();
        engine.start().unwrap();
        engine
    }

    #[test]
    fn test_lifecycle_transitions() {
        let engine = PetalScapeEngine::new(EngineDesc::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.pause().is_err());
        assert!(engine.resume().is_err());
        assert!(engine.stop().is_err());

        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.pause().unwrap();
        assert_eq!(engine.state(), EngineState::Paused);
        engine.start().unwrap();
        engine.pause().unwrap();
        engine.resume().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        let events = engine.poll_events();
        assert_eq!(events.first(), Some(&PetalScapeEvent::EngineStarted));
        assert_eq!(events.last(), Some(&PetalScapeEvent::EngineStopped));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = PetalScapeEngine::new(EngineDesc {
            block_size: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(PetalScapeError::Configuration(_))));
    }

    #[test]
    fn test_play_requires_running_engine() {
        let engine = PetalScapeEngine::new(EngineDesc::default()).unwrap();
        let source = engine.create_source();
        let result = engine.play("tap", source, &[], |_, _, _| {});
        assert_eq!(result, Err(PetalScapeError::EngineNotRunning));
    }

    #[test]
    fn test_play_on_dead_source_is_error() {
        let engine = running_engine();
        let source = engine.create_source();
        engine.destroy_source(source).unwrap();
        assert_eq!(
            engine.play("tap", source, &[], |_, _, _| {}),
            Err(PetalScapeError::InvalidHandle(source))
        );
    }

    #[test]
    fn test_unknown_asset_fails_on_next_tick() {
        let engine = running_engine();
        let source = engine.create_source();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let instance = engine
            .play("missing", source, &[], move |reason, _, _| {
                assert_eq!(reason, CompletionReason::Failure);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(engine.instance_state(instance), Ok(PlaybackState::Failed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        engine.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.instance_state(instance).is_err());
        assert!(
            engine
                .poll_events()
                .iter()
                .any(|e| matches!(e, PetalScapeEvent::ResolutionFailed { .. }))
        );
    }

    #[test]
    fn test_render_commands_for_one_shot() {
        let engine = running_engine();
        let (sink, commands) = ChannelSink::unbounded();
        engine.set_render_sink(Box::new(sink));

        let mixer = engine
            .create_mixer(
                "stereo",
                MixerKind::Channel {
                    layout: ChannelLayout::Stereo,
                },
            )
            .unwrap();
        engine
            .register_audio_asset("click", AudioBuffer::silence(1500, 48000).unwrap())
            .unwrap();
        let node = engine
            .create_node(SoundEventNode::Sampler(SamplerNode::new("click", mixer)))
            .unwrap();
        engine.register_event_asset("tap", node).unwrap();
        let source = engine.create_source();

        engine.play("tap", source, &[mixer], |_, _, _| {}).unwrap();
        engine.update();
        engine.update();

        let received: Vec<RenderCommand> = commands.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], RenderCommand::Start { gain, .. } if gain == 1.0));
        assert!(matches!(received[1], RenderCommand::Stop { .. }));
        assert_eq!(received[0].unit(), received[1].unit());
    }

    #[test]
    fn test_parameter_scopes() {
        let engine = running_engine();
        let speed = engine
            .create_parameter(MetaParameter::double("speed", 0.5, 0.0, 1.0).unwrap())
            .unwrap();
        assert_eq!(engine.parameter_by_name("speed"), Some(speed));

        engine.set_parameter_value(speed, 7.0, None).unwrap();
        assert_eq!(
            engine.parameter_value(speed, None),
            Ok(ParameterValue::Double(1.0))
        );
        assert!(matches!(
            engine.set_parameter_value(speed, "fast", None),
            Err(PetalScapeError::ParameterType(_))
        ));
    }

    #[test]
    fn test_spatial_gain_reaches_renderer() {
        let engine = running_engine();
        let (sink, commands) = ChannelSink::unbounded();
        engine.set_render_sink(Box::new(sink));
        engine.create_listener().unwrap();

        let mixer = engine
            .create_mixer("spatial", MixerKind::Spatial(SpatialMixerDesc::default()))
            .unwrap();
        engine
            .register_audio_asset("hum", AudioBuffer::silence(100, 48000).unwrap())
            .unwrap();
        let node = engine
            .create_node(SoundEventNode::Sampler(
                SamplerNode::new("hum", mixer).looping(true),
            ))
            .unwrap();
        engine.register_event_asset("hum", node).unwrap();

        let source = engine.create_source();
        engine
            .set_source_transform(source, Mat4::from_translation(Vec3::new(0.0, 0.0, -4.0)))
            .unwrap();
        engine.set_source_gain(source, 0.5).unwrap();

        engine.play("hum", source, &[mixer], |_, _, _| {}).unwrap();
        engine.update();

        let start = commands.try_recv().unwrap();
        let RenderCommand::Start { gain, .. } = start else {
            panic!("expected start command");
        };
        assert!((gain - 0.125).abs() < 1e-6);

        engine
            .set_source_transform(source, Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0)))
            .unwrap();
        engine.update();
        let update = commands.try_recv().unwrap();
        let RenderCommand::Update { gain, .. } = update else {
            panic!("expected update command");
        };
        assert!((gain - 0.25).abs() < 1e-6);
    }
}
