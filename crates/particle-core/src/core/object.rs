use slotmap::{Key, SlotMap};
use std::fmt;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{kind} {handle} was used after it was destroyed")]
    Destroyed { kind: &'static str, handle: String },
}

struct Counted<T> {
    value: T,
    refs: u32,
}

/// Reference-counted storage for kernel objects.
///
/// Handles are generation-checked slot keys: once an object's count drops to zero it is
/// dropped, its slot version is bumped, and every outstanding handle to it fails the guard
/// check on its next use instead of reaching a recycled object.
pub struct ObjectArena<K: Key, T> {
    kind: &'static str,
    slots: SlotMap<K, Counted<T>>,
}

impl<K: Key, T> ObjectArena<K, T> {
    /// Creates an empty arena; `kind` names the objects in diagnostics.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: SlotMap::with_key(),
        }
    }

    /// Stores a new object holding one reference.
    pub fn insert(&mut self, value: T) -> K {
        self.slots.insert(Counted { value, refs: 1 })
    }

    /// Takes an additional reference and returns the new count.
    pub fn acquire(&mut self, handle: K) -> Result<u32, LifecycleError> {
        let entry = self.entry_mut(handle)?;
        entry.refs += 1;
        Ok(entry.refs)
    }

    /// Drops one reference. When the last one goes, the object is removed and handed back.
    pub fn release(&mut self, handle: K) -> Result<Option<T>, LifecycleError> {
        let entry = self.entry_mut(handle)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }
        trace!(kind = self.kind, handle = ?handle, "Destroying object");
        Ok(self.slots.remove(handle).map(|counted| counted.value))
    }

    pub fn get(&self, handle: K) -> Result<&T, LifecycleError> {
        self.slots
            .get(handle)
            .map(|counted| &counted.value)
            .ok_or_else(|| self.destroyed(handle))
    }

    pub fn get_mut(&mut self, handle: K) -> Result<&mut T, LifecycleError> {
        self.entry_mut(handle).map(|counted| &mut counted.value)
    }

    pub fn ref_count(&self, handle: K) -> Option<u32> {
        self.slots.get(handle).map(|counted| counted.refs)
    }

    pub fn contains(&self, handle: K) -> bool {
        self.slots.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> + '_ {
        self.slots.iter().map(|(k, counted)| (k, &counted.value))
    }

    /// A non-owning handle that does not keep the object alive.
    pub fn weak(&self, handle: K) -> Result<WeakRef<K>, LifecycleError> {
        self.get(handle)?;
        Ok(WeakRef { handle })
    }

    fn entry_mut(&mut self, handle: K) -> Result<&mut Counted<T>, LifecycleError> {
        let kind = self.kind;
        self.slots
            .get_mut(handle)
            .ok_or_else(|| LifecycleError::Destroyed {
                kind,
                handle: format!("{handle:?}"),
            })
    }

    fn destroyed(&self, handle: K) -> LifecycleError {
        LifecycleError::Destroyed {
            kind: self.kind,
            handle: format!("{handle:?}"),
        }
    }
}

impl<K: Key, T> fmt::Debug for ObjectArena<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectArena")
            .field("kind", &self.kind)
            .field("live", &self.slots.len())
            .finish()
    }
}

/// A relationship to an object that does not own it.
///
/// Must be confirmed with [`is_live`](Self::is_live) or [`upgrade`](Self::upgrade) before the
/// referent is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakRef<K: Key> {
    handle: K,
}

impl<K: Key> WeakRef<K> {
    pub fn handle(&self) -> K {
        self.handle
    }

    pub fn is_live<T>(&self, arena: &ObjectArena<K, T>) -> bool {
        arena.contains(self.handle)
    }

    pub fn upgrade<'a, T>(&self, arena: &'a ObjectArena<K, T>) -> Option<&'a T> {
        arena.get(self.handle).ok()
    }
}
