//! Sound-event graphs.
//!
//! Nodes are created bottom-up: a node's children must exist when the node is
//! created. Named event assets point at a root node. Playing an asset walks the
//! graph from its root (see [`evaluator`]) and yields the render units to start.
//!
//! The graph is a DAG. Creating a node can never close a cycle because its
//! handle is fresh; redefining a node in place checks reachability first.

pub mod evaluator;
pub mod node;

pub use evaluator::{Evaluation, Evaluator, EvaluationInputs, UnitKind, UnitSpec};
pub use node::{
    BlendNode, BlendRange, CalibrationMode, PullStreamNode, RandomEntry, RandomNode, SamplerNode,
    SoundEventNode, SwitchFallback, SwitchNode,
};

use crate::error::{PetalScapeError, Result};
use crate::handle::{Handle, HandleAllocator, Registry};
use std::collections::{HashMap, HashSet, VecDeque};

/// Node registry, named event assets and per-node random selection history.
#[derive(Debug, Default)]
pub struct NodeGraph {
    nodes: Registry<SoundEventNode>,
    assets: HashMap<String, Handle>,
    random_history: HashMap<Handle, VecDeque<Handle>>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, allocator: &HandleAllocator, mut node: SoundEventNode) -> Result<Handle> {
        node.normalize()?;
        self.check_children_exist(&node)?;
        let kind = node.kind_name();
        let handle = self.nodes.insert(allocator, node);
        log::debug!("Created {} node {}", kind, handle);
        Ok(handle)
    }

    /// Replaces a node's definition, keeping its handle.
    ///
    /// Fails if the new definition would make `handle` reachable from itself.
    /// Instances already playing keep their resolved units.
    pub fn redefine(&mut self, handle: Handle, mut node: SoundEventNode) -> Result<()> {
        self.nodes.get(handle)?;
        node.normalize()?;
        self.check_children_exist(&node)?;
        for child in node.children() {
            if child == handle || self.reaches(child, handle) {
                return Err(PetalScapeError::Validation(format!(
                    "redefining {} would create a cycle through {}",
                    handle, child
                )));
            }
        }

        *self.nodes.get_mut(handle)? = node;
        self.random_history.remove(&handle);
        log::debug!("Redefined node {}", handle);
        Ok(())
    }

    /// Removes a node. Parents and assets referencing it are left dangling and
    /// fail when next resolved.
    pub fn destroy(&mut self, handle: Handle) -> Result<SoundEventNode> {
        let node = self.nodes.remove(handle)?;
        self.random_history.remove(&handle);
        Ok(node)
    }

    pub fn node(&self, handle: Handle) -> Result<&SoundEventNode> {
        self.nodes.get(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.nodes.contains(handle)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Registers (or replaces) a named event asset rooted at `root`.
    ///
    /// Returns true when the name was new.
    pub fn register_asset(&mut self, name: &str, root: Handle) -> Result<bool> {
        if name.is_empty() {
            return Err(PetalScapeError::Validation(
                "event asset name must not be empty".into(),
            ));
        }
        self.nodes.get(root)?;
        let replaced = self.assets.insert(name.to_string(), root);
        if let Some(previous) = replaced {
            log::info!("Replaced event asset '{}' ({} -> {})", name, previous, root);
        } else {
            log::info!("Registered event asset '{}' rooted at {}", name, root);
        }
        Ok(replaced.is_none())
    }

    /// Removes a named asset. Its nodes stay alive.
    pub fn unregister_asset(&mut self, name: &str) -> Result<Handle> {
        self.assets
            .remove(name)
            .ok_or_else(|| PetalScapeError::NotFound(format!("event asset '{}'", name)))
    }

    pub fn asset_root(&self, name: &str) -> Option<Handle> {
        self.assets.get(name).copied()
    }

    pub fn asset_names(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    /// Picks of a random node, oldest first.
    pub(crate) fn random_history(&self, node: Handle) -> Option<&VecDeque<Handle>> {
        self.random_history.get(&node)
    }

    /// Appends a pick, keeping at most `queue_len` entries.
    pub(crate) fn record_random_pick(&mut self, node: Handle, choice: Handle, queue_len: usize) {
        if queue_len == 0 {
            return;
        }
        let history = self.random_history.entry(node).or_default();
        history.push_back(choice);
        while history.len() > queue_len {
            history.pop_front();
        }
    }

    fn check_children_exist(&self, node: &SoundEventNode) -> Result<()> {
        node.children()
            .into_iter()
            .try_for_each(|child| self.nodes.get(child).map(|_| ()))
    }

    /// Whether `target` can be reached from `from` following child links.
    /// Dangling links are skipped.
    fn reaches(&self, from: Handle, target: Handle) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Ok(node) = self.nodes.get(current) {
                stack.extend(node.children());
            }
        }
        false
    }
}
