use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use petalscape::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const SAMPLE_RATE: u32 = 48000;
const BLOCK_SIZE: usize = 1024;

pub fn run_all() -> Result<()> {
    log::info!("=== Running Spatial Tap Demo ===");
    run_spatial_tap()?;

    log::info!("\n=== Running Footsteps Demo ===");
    run_footsteps()?;

    log::info!("\n=== Running Voice Stream Demo ===");
    run_voice_stream()
}

fn sine(frequency: f32, seconds: f32) -> Result<AudioBuffer> {
    let frames = (SAMPLE_RATE as f32 * seconds) as usize;
    let samples = (0..frames)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.5
        })
        .collect();
    Ok(AudioBuffer::new(samples, SAMPLE_RATE, 1)?)
}

fn new_engine() -> Result<Arc<PetalScapeEngine>> {
    let engine = PetalScapeEngine::new(EngineDesc {
        sample_rate: SAMPLE_RATE,
        block_size: BLOCK_SIZE,
        ..Default::default()
    })
    .context("Failed to create engine")?;
    Ok(Arc::new(engine))
}

/// Stands in for an audio backend: logs what it would render and drains streams.
fn spawn_renderer(commands: Receiver<RenderCommand>) -> JoinHandle<usize> {
    std::thread::spawn(move || {
        let block = Duration::from_secs_f64(BLOCK_SIZE as f64 / f64::from(SAMPLE_RATE));
        let mut streams: HashMap<Handle, StreamReader> = HashMap::new();
        let mut scratch = vec![0.0f32; BLOCK_SIZE * 2];
        let mut frames_pulled = 0;

        loop {
            match commands.recv_timeout(block) {
                Ok(RenderCommand::Start {
                    unit,
                    instance,
                    input,
                    gain,
                    rate,
                    ..
                }) => {
                    log::info!(
                        "[render] start unit {} of instance {} (gain {:.3}, rate {:.2})",
                        unit,
                        instance,
                        gain,
                        rate
                    );
                    if let RenderInput::Stream(reader) = input {
                        streams.insert(unit, reader);
                    }
                }
                Ok(RenderCommand::Update { unit, gain, rate }) => {
                    log::debug!("[render] unit {} gain {:.3} rate {:.2}", unit, gain, rate);
                }
                Ok(RenderCommand::Stop { unit }) => {
                    streams.remove(&unit);
                    log::info!("[render] stop unit {}", unit);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            for reader in streams.values_mut() {
                let channels = usize::from(reader.format().channels);
                let frames = reader
                    .available_frames()
                    .min(BLOCK_SIZE)
                    .min(scratch.len() / channels);
                if frames > 0 && reader.read(&mut scratch, frames).is_ok() {
                    frames_pulled += frames;
                }
            }
        }
        frames_pulled
    })
}

fn tick_for(engine: &PetalScapeEngine, ticks: usize) {
    let block = Duration::from_secs_f64(BLOCK_SIZE as f64 / f64::from(SAMPLE_RATE));
    for _ in 0..ticks {
        engine.update();
        std::thread::sleep(block);
    }
}

fn log_events(engine: &PetalScapeEngine) {
    for event in engine.poll_events() {
        if event.is_error() {
            log::warn!("event: {:?}", event);
        } else {
            log::debug!("event: {:?}", event);
        }
    }
}

/// A click orbiting the listener behind a wooden wall.
pub fn run_spatial_tap() -> Result<()> {
    let engine = new_engine()?;
    let (sink, commands) = ChannelSink::unbounded();
    engine.set_render_sink(Box::new(sink));
    let renderer = spawn_renderer(commands);

    engine.start()?;
    engine.create_listener()?;
    engine.set_listener_transform(Pose::identity().to_transform())?;

    let mixer = engine.create_mixer(
        "spatial",
        MixerKind::Spatial(SpatialMixerDesc {
            cull_distance: 10.0,
            source_directivity: DirectivityModel::cardioid(vec![DirectivitySubband::cardioid(
                1000.0, 0.5, 1.0,
            )]),
            ..Default::default()
        }),
    )?;
    engine.register_audio_asset("click", sine(880.0, 0.25)?)?;
    let click = engine.create_node(SoundEventNode::Sampler(
        SamplerNode::new("click", mixer).looping(true),
    ))?;
    engine.register_event_asset("tap", click)?;

    engine.create_material("wood", MaterialPreset::Wood)?;
    let wall = Mesh::cuboid(Vec3::new(1.0, 2.0, 0.1));
    let occluder = engine.create_occluder(wall.positions(), wall.normals(), wall.indices())?;
    engine.set_occluder_transform(occluder, Mat4::from_translation(Vec3::new(0.0, 0.0, -3.0)))?;
    engine.set_occluder_material(occluder, "wood")?;
    engine.set_reverb_preset(ReverbPreset::MediumRoom);

    let source = engine.create_source();
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    let instance = engine.play("tap", source, &[mixer], move |reason, source, instance| {
        log::info!("Instance {} on source {} completed: {:?}", instance, source, reason);
        counter.fetch_add(1, Ordering::SeqCst);
    })?;

    for step in 0..16 {
        let angle = step as f32 / 16.0 * std::f32::consts::TAU;
        let position = Vec3::new(angle.sin() * 6.0, 0.0, -angle.cos() * 6.0);
        engine.set_source_transform(source, Mat4::from_translation(position))?;
        tick_for(&engine, 4);
        log_events(&engine);
    }

    engine.stop_instance(instance)?;
    tick_for(&engine, 1);
    engine.stop()?;
    log::info!("Completions delivered: {}", done.load(Ordering::SeqCst));

    drop(engine);
    let _ = renderer.join();
    Ok(())
}

/// Switch on a string surface parameter with random variations per surface.
pub fn run_footsteps() -> Result<()> {
    let engine = new_engine()?;
    let (sink, commands) = ChannelSink::unbounded();
    engine.set_render_sink(Box::new(sink));
    let renderer = spawn_renderer(commands);
    engine.start()?;

    let mixer = engine.create_mixer(
        "stereo",
        MixerKind::Channel {
            layout: ChannelLayout::Stereo,
        },
    )?;
    let surface = engine.create_parameter(MetaParameter::string("surface", "wood")?)?;
    let speed = engine.create_parameter(MetaParameter::double("speed", 1.0, 0.5, 2.0)?)?;

    let mut entries = Vec::new();
    for (surface_name, base) in [("wood", 220.0), ("gravel", 330.0)] {
        let mut variations = Vec::new();
        for index in 0..3 {
            let name = format!("{}_{}", surface_name, index);
            engine.register_audio_asset(&name, sine(base + index as f32 * 20.0, 0.15)?)?;
            let node = engine.create_node(SoundEventNode::Sampler(
                SamplerNode::new(&name, mixer).with_rate_parameter(speed),
            ))?;
            variations.push((node, 1.0));
        }
        let random = engine.create_node(SoundEventNode::Random(RandomNode::new(variations, 2)))?;
        entries.push((surface_name.to_string(), random));
    }
    let switch = engine.create_node(SoundEventNode::Switch(
        SwitchNode::new(surface, entries).with_fallback(SwitchFallback::FirstEntry),
    ))?;
    engine.register_event_asset("footstep", switch)?;

    let source = engine.create_source();
    for (step, ground) in ["wood", "wood", "gravel", "gravel", "mud"].iter().enumerate() {
        engine.set_parameter_value(surface, *ground, None)?;
        engine.set_parameter_value(speed, 1.0 + step as f64 * 0.1, None)?;
        engine.play("footstep", source, &[mixer], |reason, _, instance| {
            log::info!("Footstep {} done: {:?}", instance, reason);
        })?;
        tick_for(&engine, 10);
        log_events(&engine);
    }

    engine.stop()?;
    drop(engine);
    let _ = renderer.join();
    Ok(())
}

/// Feeds generated PCM into a pull-stream node from a producer thread.
pub fn run_voice_stream() -> Result<()> {
    let engine = new_engine()?;
    let (sink, commands) = ChannelSink::unbounded();
    engine.set_render_sink(Box::new(sink));
    let renderer = spawn_renderer(commands);
    engine.start()?;

    let mixer = engine.create_mixer(
        "voice",
        MixerKind::Channel {
            layout: ChannelLayout::Mono,
        },
    )?;
    let format = StreamFormat::new(SAMPLE_RATE, 1);
    let voice = engine.create_node(SoundEventNode::PullStream(PullStreamNode::new(
        "voice_chat",
        mixer,
        format,
    )))?;
    engine.register_event_asset("voice", voice)?;

    let (mut writer, reader) = StreamingRingBuffer::new(format, BLOCK_SIZE, 8)?.split();
    let source = engine.create_source();
    let instance = engine.play_with_options(
        "voice",
        source,
        &[mixer],
        PlayOptions::new().with_stream_reader("voice_chat", reader),
        |reason, _, instance| log::info!("Voice stream {} ended: {:?}", instance, reason),
    )?;

    let producer = std::thread::spawn(move || {
        let tone = sine(440.0, BLOCK_SIZE as f32 / SAMPLE_RATE as f32)?;
        let mut written = 0;
        for _ in 0..40 {
            if writer.free_frames() >= BLOCK_SIZE {
                writer.write(tone.samples(), BLOCK_SIZE)?;
                written += BLOCK_SIZE;
            }
            std::thread::sleep(Duration::from_millis(15));
        }
        Ok::<usize, anyhow::Error>(written)
    });

    tick_for(&engine, 40);
    log_events(&engine);
    engine.stop_instance(instance)?;
    tick_for(&engine, 1);

    let written = producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    engine.stop()?;
    drop(engine);
    let pulled = renderer
        .join()
        .map_err(|_| anyhow::anyhow!("render thread panicked"))?;
    log::info!("Voice stream: wrote {} frames, renderer pulled {}", written, pulled);
    Ok(())
}
