//! Walks a sound-event graph and resolves the render units it currently produces.
//!
//! Evaluation is pure with respect to the graph definition except for random
//! nodes: a random node's pick is recorded in the caller's `choices` map (so
//! re-evaluating the same instance keeps it) and, once the whole walk has
//! resolved, in the node's unique-selection history.

use crate::audio_asset::{AudioAssetTable, AudioBuffer};
use crate::error::{PetalScapeError, Result};
use crate::graph::NodeGraph;
use crate::graph::node::{
    BlendNode, CalibrationMode, RandomNode, SoundEventNode, SwitchFallback, SwitchNode,
};
use crate::handle::{Handle, Registry};
use crate::mixer::Mixer;
use crate::parameter::{ParameterStore, ParameterValues};
use crate::stream::StreamFormat;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum UnitKind {
    Sample {
        asset: String,
        buffer: Arc<AudioBuffer>,
        looping: bool,
        rate_parameter: Option<Handle>,
    },
    Stream {
        name: String,
        format: StreamFormat,
    },
}

/// A render unit the graph wants playing.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Nodes from the root to the terminal node. Identifies the unit across
    /// re-evaluations.
    pub path: Vec<Handle>,
    pub kind: UnitKind,
    pub mixer: Handle,
    pub calibration: CalibrationMode,
    pub level: f64,
    /// Product of the blend gains along the path
    pub blend_gain: f64,
}

impl UnitSpec {
    pub fn terminal(&self) -> Handle {
        self.path.last().copied().unwrap_or(Handle::INVALID)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub units: Vec<UnitSpec>,
    /// Switch nodes that produced nothing, with the label they were given
    pub unmatched_switches: Vec<(Handle, String)>,
}

/// Read-only state an evaluation depends on.
pub struct EvaluationInputs<'a> {
    pub parameters: &'a ParameterStore,
    pub overrides: &'a ParameterValues,
    pub mixers: &'a Registry<Mixer>,
    /// Mixers the instance was started with
    pub allowed_mixers: &'a [Handle],
    pub audio_assets: &'a AudioAssetTable,
    /// Listener-to-source distance used by auto-distance blends
    pub source_distance: f32,
    pub default_fallback: &'a SwitchFallback,
}

pub struct Evaluator<'a, R: Rng> {
    graph: &'a mut NodeGraph,
    inputs: EvaluationInputs<'a>,
    choices: &'a mut HashMap<Handle, Handle>,
    rng: &'a mut R,
    /// (node, pick, queue length) committed to the history on success
    picks: Vec<(Handle, Handle, usize)>,
}

impl<'a, R: Rng> Evaluator<'a, R> {
    pub fn new(
        graph: &'a mut NodeGraph,
        inputs: EvaluationInputs<'a>,
        choices: &'a mut HashMap<Handle, Handle>,
        rng: &'a mut R,
    ) -> Self {
        Self {
            graph,
            inputs,
            choices,
            rng,
            picks: Vec::new(),
        }
    }

    /// Resolves every unit reachable from `root` under the current inputs.
    ///
    /// Any dangling reference (node, mixer, parameter, audio asset) fails the
    /// whole evaluation and leaves the random histories untouched.
    pub fn evaluate(mut self, root: Handle) -> Result<Evaluation> {
        let mut evaluation = Evaluation::default();
        let mut path = Vec::new();
        self.visit(root, &mut path, 1.0, &mut evaluation)?;
        for (node, choice, queue_len) in self.picks.drain(..) {
            self.graph.record_random_pick(node, choice, queue_len);
        }
        Ok(evaluation)
    }

    fn visit(
        &mut self,
        handle: Handle,
        path: &mut Vec<Handle>,
        gain: f64,
        out: &mut Evaluation,
    ) -> Result<()> {
        let node = self.graph.node(handle)?.clone();
        path.push(handle);

        match node {
            SoundEventNode::Sampler(sampler) => {
                self.check_mixer(sampler.mixer)?;
                if let Some(rate) = sampler.rate_parameter {
                    self.inputs.parameters.entry(rate)?;
                }
                let buffer = self.inputs.audio_assets.get(&sampler.asset).ok_or_else(|| {
                    PetalScapeError::NotFound(format!("audio asset '{}'", sampler.asset))
                })?;
                out.units.push(UnitSpec {
                    path: path.clone(),
                    kind: UnitKind::Sample {
                        asset: sampler.asset,
                        buffer,
                        looping: sampler.looping,
                        rate_parameter: sampler.rate_parameter,
                    },
                    mixer: sampler.mixer,
                    calibration: sampler.calibration,
                    level: sampler.level,
                    blend_gain: gain,
                });
            }
            SoundEventNode::PullStream(stream) => {
                self.check_mixer(stream.mixer)?;
                out.units.push(UnitSpec {
                    path: path.clone(),
                    kind: UnitKind::Stream {
                        name: stream.stream,
                        format: stream.format,
                    },
                    mixer: stream.mixer,
                    calibration: stream.calibration,
                    level: stream.level,
                    blend_gain: gain,
                });
            }
            SoundEventNode::Switch(switch) => {
                if let Some(child) = self.select_switch_child(handle, &switch, out)? {
                    self.visit(child, path, gain, out)?;
                }
            }
            SoundEventNode::Random(random) => {
                if let Some(child) = self.select_random_child(handle, &random) {
                    self.visit(child, path, gain, out)?;
                }
            }
            SoundEventNode::Blend(blend) => {
                let value = self.blend_value(&blend)?;
                for range in &blend.ranges {
                    let range_gain = range.gain(value);
                    if range_gain > 0.0 {
                        self.visit(range.child, path, gain * range_gain, out)?;
                    }
                }
            }
            SoundEventNode::Container(children) => {
                for child in children {
                    self.visit(child, path, gain, out)?;
                }
            }
        }

        path.pop();
        Ok(())
    }

    fn check_mixer(&self, mixer: Handle) -> Result<()> {
        self.inputs.mixers.get(mixer)?;
        if !self.inputs.allowed_mixers.contains(&mixer) {
            return Err(PetalScapeError::NotFound(format!(
                "{} is not in the instance's mixer set",
                mixer
            )));
        }
        Ok(())
    }

    fn select_switch_child(
        &self,
        handle: Handle,
        switch: &SwitchNode,
        out: &mut Evaluation,
    ) -> Result<Option<Handle>> {
        let value = self
            .inputs
            .parameters
            .value(switch.parameter, self.inputs.overrides)?;
        let label = value.as_label().ok_or_else(|| {
            PetalScapeError::ParameterType(format!(
                "switch {} needs a string or integer parameter",
                handle
            ))
        })?;

        if let Some(child) = switch.child_for(&label) {
            return Ok(Some(child));
        }

        let fallback = switch
            .fallback
            .as_ref()
            .unwrap_or(self.inputs.default_fallback);
        let child = match fallback {
            SwitchFallback::Silent => None,
            SwitchFallback::FirstEntry => switch.entries.first().map(|(_, child)| *child),
            SwitchFallback::Label(fallback_label) => switch.child_for(fallback_label),
        };
        if child.is_none() {
            out.unmatched_switches.push((handle, label));
        }
        Ok(child)
    }

    fn select_random_child(&mut self, handle: Handle, random: &RandomNode) -> Option<Handle> {
        if random.entries.is_empty() {
            return None;
        }
        if let Some(previous) = self.choices.get(&handle) {
            if random.entries.iter().any(|e| e.child == *previous) {
                return Some(*previous);
            }
        }

        let queue_len = random.unique_selection_queue;
        // Most recent first
        let recent: Vec<Handle> = self
            .graph
            .random_history(handle)
            .map(|history| history.iter().rev().take(queue_len).copied().collect())
            .unwrap_or_default();

        let mut pool: Vec<_> = random
            .entries
            .iter()
            .filter(|e| !recent.contains(&e.child))
            .collect();
        if pool.is_empty() {
            let last = recent.first().copied();
            pool = random
                .entries
                .iter()
                .filter(|e| Some(e.child) != last)
                .collect();
        }
        if pool.is_empty() {
            pool = random.entries.iter().collect();
        }

        let total: f32 = pool.iter().map(|e| e.weight).sum();
        let mut target = self.rng.gen_range(0.0..total);
        let mut choice = pool[pool.len() - 1].child;
        for entry in &pool {
            if target < entry.weight {
                choice = entry.child;
                break;
            }
            target -= entry.weight;
        }

        self.picks.push((handle, choice, queue_len));
        self.choices.insert(handle, choice);
        Some(choice)
    }

    fn blend_value(&self, blend: &BlendNode) -> Result<f64> {
        if blend.auto_distance {
            return Ok(f64::from(self.inputs.source_distance));
        }
        let parameter = blend.parameter.ok_or_else(|| {
            PetalScapeError::Validation("blend node has no controlling parameter".into())
        })?;
        self.inputs
            .parameters
            .value(parameter, self.inputs.overrides)?
            .as_f64()
            .ok_or_else(|| {
                PetalScapeError::ParameterType("blend parameter must be numeric".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{BlendRange, SamplerNode};
    use crate::handle::HandleAllocator;
    use crate::mixer::{ChannelLayout, MixerKind};
    use crate::parameter::{MetaParameter, ParameterValue};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct Fixture {
        allocator: HandleAllocator,
        graph: NodeGraph,
        parameters: ParameterStore,
        mixers: Registry<Mixer>,
        assets: AudioAssetTable,
        mixer: Handle,
        rng: ChaCha8Rng,
    }

    impl Fixture {
        fn new() -> Self {
            let allocator = HandleAllocator::new();
            let mut mixers = Registry::new();
            let mixer = mixers.insert(
                &allocator,
                Mixer::new(
                    "bus",
                    MixerKind::Channel {
                        layout: ChannelLayout::Stereo,
                    },
                )
                .unwrap(),
            );
            let mut assets = AudioAssetTable::new();
            for name in ["a", "b", "c", "d"] {
                assets
                    .register(name, AudioBuffer::silence(100, 48000).unwrap())
                    .unwrap();
            }
            Self {
                allocator,
                graph: NodeGraph::new(),
                parameters: ParameterStore::new(),
                mixers,
                assets,
                mixer,
                rng: ChaCha8Rng::seed_from_u64(7),
            }
        }

        fn sampler(&mut self, asset: &str) -> Handle {
            self.graph
                .create(
                    &self.allocator,
                    SoundEventNode::Sampler(SamplerNode::new(asset, self.mixer)),
                )
                .unwrap()
        }

        fn node(&mut self, node: SoundEventNode) -> Handle {
            self.graph.create(&self.allocator, node).unwrap()
        }

        fn evaluate_with(
            &mut self,
            root: Handle,
            overrides: &ParameterValues,
            choices: &mut HashMap<Handle, Handle>,
        ) -> Result<Evaluation> {
            let mixers = [self.mixer];
            let fallback = SwitchFallback::Silent;
            let inputs = EvaluationInputs {
                parameters: &self.parameters,
                overrides,
                mixers: &self.mixers,
                allowed_mixers: &mixers,
                audio_assets: &self.assets,
                source_distance: 0.0,
                default_fallback: &fallback,
            };
            Evaluator::new(&mut self.graph, inputs, choices, &mut self.rng).evaluate(root)
        }

        fn evaluate(&mut self, root: Handle) -> Result<Evaluation> {
            self.evaluate_with(root, &ParameterValues::new(), &mut HashMap::new())
        }
    }

    fn sample_names(evaluation: &Evaluation) -> Vec<String> {
        evaluation
            .units
            .iter()
            .map(|unit| match &unit.kind {
                UnitKind::Sample { asset, .. } => asset.clone(),
                UnitKind::Stream { name, .. } => name.clone(),
            })
            .collect()
    }

    #[test]
    fn test_container_plays_all_children() {
        let mut fx = Fixture::new();
        let a = fx.sampler("a");
        let b = fx.sampler("b");
        let root = fx.node(SoundEventNode::Container(vec![a, b]));

        let evaluation = fx.evaluate(root).unwrap();
        assert_eq!(sample_names(&evaluation), vec!["a", "b"]);
        assert_eq!(evaluation.units[0].path, vec![root, a]);
        assert_eq!(evaluation.units[1].terminal(), b);
    }

    #[test]
    fn test_switch_selects_by_label_and_falls_back() {
        let mut fx = Fixture::new();
        let surface = fx
            .parameters
            .create(&fx.allocator, MetaParameter::string("surface", "grass").unwrap())
            .unwrap();
        let grass = fx.sampler("a");
        let wood = fx.sampler("b");
        let entries = vec![("grass".to_string(), grass), ("wood".to_string(), wood)];
        let silent = fx.node(SoundEventNode::Switch(SwitchNode::new(surface, entries.clone())));
        let first = fx.node(SoundEventNode::Switch(
            SwitchNode::new(surface, entries).with_fallback(SwitchFallback::FirstEntry),
        ));

        assert_eq!(sample_names(&fx.evaluate(silent).unwrap()), vec!["a"]);

        let mut overrides = ParameterValues::new();
        overrides.insert(surface, ParameterValue::Str("wood".into()));
        let evaluation = fx
            .evaluate_with(silent, &overrides, &mut HashMap::new())
            .unwrap();
        assert_eq!(sample_names(&evaluation), vec!["b"]);

        overrides.insert(surface, ParameterValue::Str("metal".into()));
        let evaluation = fx
            .evaluate_with(silent, &overrides, &mut HashMap::new())
            .unwrap();
        assert!(evaluation.units.is_empty());
        assert_eq!(evaluation.unmatched_switches, vec![(silent, "metal".to_string())]);

        let evaluation = fx
            .evaluate_with(first, &overrides, &mut HashMap::new())
            .unwrap();
        assert_eq!(sample_names(&evaluation), vec!["a"]);
        assert!(evaluation.unmatched_switches.is_empty());
    }

    #[test]
    fn test_random_unique_within_queue_length() {
        let mut fx = Fixture::new();
        let children: Vec<Handle> = ["a", "b", "c", "d"].iter().map(|n| fx.sampler(n)).collect();
        let queue_len = 2;
        let root = fx.node(SoundEventNode::Random(RandomNode::new(
            children.iter().map(|c| (*c, 1.0)).collect(),
            queue_len,
        )));

        let picks: Vec<Handle> = (0..200)
            .map(|_| fx.evaluate(root).unwrap().units[0].terminal())
            .collect();
        for window in picks.windows(queue_len + 1) {
            for i in 0..window.len() {
                for j in (i + 1)..window.len() {
                    assert_ne!(window[i], window[j]);
                }
            }
        }
    }

    #[test]
    fn test_random_queue_longer_than_pool_still_picks() {
        let mut fx = Fixture::new();
        let a = fx.sampler("a");
        let b = fx.sampler("b");
        let root = fx.node(SoundEventNode::Random(RandomNode::new(vec![(a, 1.0), (b, 1.0)], 5)));

        let picks: Vec<Handle> = (0..20)
            .map(|_| fx.evaluate(root).unwrap().units[0].terminal())
            .collect();
        for pair in picks.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        let single = fx.node(SoundEventNode::Random(RandomNode::new(vec![(a, 1.0)], 3)));
        for _ in 0..3 {
            assert_eq!(fx.evaluate(single).unwrap().units[0].terminal(), a);
        }
    }

    #[test]
    fn test_failed_walk_leaves_random_history_untouched() {
        let mut fx = Fixture::new();
        let a = fx.sampler("a");
        let b = fx.sampler("b");
        let random = fx.node(SoundEventNode::Random(RandomNode::new(vec![(a, 1.0), (b, 1.0)], 1)));
        let missing = fx.sampler("nope");
        let root = fx.node(SoundEventNode::Container(vec![random, missing]));

        assert!(fx.evaluate(root).is_err());
        assert!(fx.graph.random_history(random).is_none());

        let pick = fx.evaluate(random).unwrap().units[0].terminal();
        assert_eq!(fx.graph.random_history(random).unwrap().back(), Some(&pick));
    }

    #[test]
    fn test_random_choice_fixed_per_instance() {
        let mut fx = Fixture::new();
        let children: Vec<Handle> = ["a", "b", "c", "d"].iter().map(|n| fx.sampler(n)).collect();
        let root = fx.node(SoundEventNode::Random(RandomNode::new(
            children.iter().map(|c| (*c, 1.0)).collect(),
            0,
        )));

        let overrides = ParameterValues::new();
        let mut choices = HashMap::new();
        let first = fx.evaluate_with(root, &overrides, &mut choices).unwrap();
        for _ in 0..10 {
            let again = fx.evaluate_with(root, &overrides, &mut choices).unwrap();
            assert_eq!(again.units[0].terminal(), first.units[0].terminal());
        }
    }

    #[test]
    fn test_empty_random_yields_no_unit() {
        let mut fx = Fixture::new();
        let root = fx.node(SoundEventNode::Random(RandomNode::new(vec![], 0)));
        assert!(fx.evaluate(root).unwrap().units.is_empty());
    }

    #[test]
    fn test_blend_gains_follow_parameter() {
        let mut fx = Fixture::new();
        let speed = fx
            .parameters
            .create(&fx.allocator, MetaParameter::double("speed", 0.0, 0.0, 10.0).unwrap())
            .unwrap();
        let walk = fx.sampler("a");
        let run = fx.sampler("b");
        let root = fx.node(SoundEventNode::Blend(BlendNode::with_parameter(
            speed,
            vec![
                BlendRange::new(walk, 0.0, 0.0, 4.0, 6.0),
                BlendRange::new(run, 4.0, 6.0, 10.0, 10.0),
            ],
        )));

        let mut overrides = ParameterValues::new();
        overrides.insert(speed, ParameterValue::Double(5.0));
        let evaluation = fx
            .evaluate_with(root, &overrides, &mut HashMap::new())
            .unwrap();
        assert_eq!(sample_names(&evaluation), vec!["a", "b"]);
        assert!((evaluation.units[0].blend_gain - 0.5).abs() < 1e-9);
        assert!((evaluation.units[1].blend_gain - 0.5).abs() < 1e-9);

        overrides.insert(speed, ParameterValue::Double(2.0));
        let evaluation = fx
            .evaluate_with(root, &overrides, &mut HashMap::new())
            .unwrap();
        assert_eq!(sample_names(&evaluation), vec!["a"]);
    }

    #[test]
    fn test_dangling_references_fail() {
        let mut fx = Fixture::new();
        let a = fx.sampler("a");
        let root = fx.node(SoundEventNode::Container(vec![a]));
        fx.graph.destroy(a).unwrap();
        assert_eq!(fx.evaluate(root).unwrap_err(), PetalScapeError::InvalidHandle(a));

        let missing_asset = fx.sampler("nope");
        assert!(matches!(
            fx.evaluate(missing_asset),
            Err(PetalScapeError::NotFound(_))
        ));

        let other_mixer = fx.mixers.insert(
            &fx.allocator,
            Mixer::new(
                "other",
                MixerKind::Channel {
                    layout: ChannelLayout::Mono,
                },
            )
            .unwrap(),
        );
        let foreign = fx.node(SoundEventNode::Sampler(SamplerNode::new("a", other_mixer)));
        assert!(matches!(fx.evaluate(foreign), Err(PetalScapeError::NotFound(_))));

        let orphan = fx.sampler("b");
        let mixer = fx.mixer;
        fx.mixers.remove(mixer).unwrap();
        assert_eq!(
            fx.evaluate(orphan).unwrap_err(),
            PetalScapeError::InvalidHandle(mixer)
        );
    }
}
