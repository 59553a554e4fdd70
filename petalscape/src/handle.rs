//! Opaque entity handles and the typed registries that resolve them.
//!
//! Every entity the engine manages (sources, occluders, mixers, parameters,
//! nodes, playback instances) is addressed through a [`Handle`]. Relationships
//! between entities are stored as handle values and resolved through a
//! [`Registry`], so nothing holds an owning reference to anything else.

use crate::error::{PetalScapeError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Lightweight, type-erased handle for engine entities.
///
/// Handles are allocated from a single engine-wide counter, are strictly
/// increasing and are never reused. [`Handle::INVALID`] is the reserved
/// "none" value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i64);

impl Handle {
    /// Sentinel value denoting "invalid / none".
    pub const INVALID: Handle = Handle(-1);

    /// Wraps a raw handle value received from the outside.
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit value of this handle.
    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Hands out strictly increasing, non-negative handles.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: AtomicI64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
        }
    }

    pub fn allocate(&self) -> Handle {
        Handle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Maps handles to values of one entity kind.
#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<Handle, T>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Allocates a fresh handle and stores `value` under it.
    pub fn insert(&mut self, allocator: &HandleAllocator, value: T) -> Handle {
        let handle = allocator.allocate();
        self.entries.insert(handle, value);
        handle
    }

    /// Like [`Registry::insert`] for values that need to know their own handle.
    pub fn insert_with(&mut self, allocator: &HandleAllocator, make: impl FnOnce(Handle) -> T) -> Handle {
        let handle = allocator.allocate();
        self.entries.insert(handle, make(handle));
        handle
    }

    pub fn get(&self, handle: Handle) -> Result<&T> {
        self.entries
            .get(&handle)
            .ok_or(PetalScapeError::InvalidHandle(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.entries
            .get_mut(&handle)
            .ok_or(PetalScapeError::InvalidHandle(handle))
    }

    /// Removes the entity. A second removal of the same handle fails.
    pub fn remove(&mut self, handle: Handle) -> Result<T> {
        self.entries
            .remove(&handle)
            .ok_or(PetalScapeError::InvalidHandle(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries.iter().map(|(h, v)| (*h, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.entries.iter_mut().map(|(h, v)| (*h, v))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(Handle, &mut T) -> bool) {
        self.entries.retain(|h, v| keep(*h, v));
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
