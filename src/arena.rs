//! Generation-checked storage for the resources owned by a [`Context`](crate::Context).
//!
//! Every resource lives in a per-kind [`Arena`] and is referred to by a typed [`Handle`]. A
//! handle records the context it was issued by and the generation of the slot it points to, so
//! a handle to a destroyed resource (or to a resource of another context) is rejected with
//! [`Error::StaleHandle`] instead of silently aliasing whatever reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use slab::Slab;

use crate::error::{Error, Result};
use crate::graph::Resource;

/// A typed reference to a resource owned by a [`Context`](crate::Context).
///
/// Handles are plain values: copying one does not keep the resource alive, and destroying the
/// resource turns every copy stale.
pub struct Handle<T> {
    context: u32,
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Identifier of the context that issued this handle.
    pub fn context_id(&self) -> u32 {
        self.context
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.hash(state);
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T: Resource> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({}:{}@{})",
            T::KIND,
            self.context,
            self.index,
            self.generation
        )
    }
}

struct Slot<T> {
    generation: u32,
    value: T,
}

/// Slab of resources of one kind, all owned by the same context.
pub(crate) struct Arena<T> {
    context: u32,
    next_generation: u32,
    slots: Slab<Slot<T>>,
}

impl<T: Resource> Arena<T> {
    pub(crate) fn new(context: u32) -> Self {
        Arena {
            context,
            next_generation: 0,
            slots: Slab::new(),
        }
    }

    fn handle(&self, index: usize, generation: u32) -> Handle<T> {
        Handle {
            context: self.context,
            index: index as u32,
            generation,
            _kind: PhantomData,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> Handle<T> {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Slot { generation, value });
        self.handle(index, generation)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        if handle.context != self.context {
            return None;
        }
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    pub(crate) fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.slot(handle)
            .map(|slot| &slot.value)
            .ok_or(Error::StaleHandle(T::KIND))
    }

    pub(crate) fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        if !self.contains(handle) {
            return Err(Error::StaleHandle(T::KIND));
        }
        self.slots
            .get_mut(handle.index as usize)
            .map(|slot| &mut slot.value)
            .ok_or(Error::StaleHandle(T::KIND))
    }

    pub(crate) fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        if !self.contains(handle) {
            return Err(Error::StaleHandle(T::KIND));
        }
        Ok(self.slots.remove(handle.index as usize).value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .map(|(index, slot)| (self.handle(index, slot.generation), &slot.value))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> + '_ {
        let context = self.context;
        self.slots.iter_mut().map(move |(index, slot)| {
            let handle = Handle {
                context,
                index: index as u32,
                generation: slot.generation,
                _kind: PhantomData,
            };
            (handle, &mut slot.value)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
