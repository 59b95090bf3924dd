//! Generation-checked object handles.
//!
//! Every live device object is addressed by a [`Handle`] into a
//! [`HandleTable`]. Removing an object bumps the generation of its slot, so a
//! handle kept past destruction is detected instead of silently resolving to
//! whatever object reuses the slot.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Typed handle to an object stored in a [`HandleTable`].
pub struct Handle<T> {
    index: u32,
    generation: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: NonZeroU32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index inside the owning table.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation.get()
    }

    /// Pack into the 64-bit non-dispatchable form used at the loader boundary.
    ///
    /// The result is never zero, so `0` stays available as the null handle.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.generation.get() as u64) << 32) | self.index as u64
    }

    /// Unpack a 64-bit handle. Returns `None` for the null handle.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU32::new((raw >> 32) as u32) {
            Some(generation) => Some(Self::new(raw as u32, generation)),
            None => None,
        }
    }

    /// Reinterpret as a handle of another object type.
    ///
    /// Used when a dispatch layer stores handles without static types.
    pub const fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index, self.generation)
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
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_raw().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}v{})", kind_name::<T>(), self.index, self.generation)
    }
}

/// Short type name used in diagnostics.
pub fn kind_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

struct Slot<T> {
    generation: NonZeroU32,
    value: Option<Arc<T>>,
}

/// Arena of reference-counted objects addressed by generation-checked handles.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HandleTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.insert_arc(Arc::new(value))
    }

    /// Store an already shared object and return its handle.
    pub fn insert_arc(&mut self, value: Arc<T>) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: NonZeroU32::MIN,
            value: Some(value),
        });
        Handle::new(index, NonZeroU32::MIN)
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Resolve a handle.
    pub fn get(&self, handle: Handle<T>) -> Result<&Arc<T>> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| invalid(handle))
    }

    /// Whether the handle names a live object.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Remove an object. The slot's generation is bumped so the handle goes stale.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<Arc<T>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| invalid(handle))?;
        let value = slot.value.take().ok_or_else(|| invalid(handle))?;

        slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no object is live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live objects.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &Arc<T>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }
}

fn invalid<T>(handle: Handle<T>) -> Error {
    Error::InvalidHandle {
        kind: kind_name::<T>(),
        raw: handle.to_raw(),
    }
}

/// Thread-safe [`HandleTable`].
///
/// Create and destroy calls from many threads are serialized by a single
/// mutex. Lookups clone the `Arc` and release the lock immediately, so no
/// caller holds the table while working with an object.
pub struct Registry<T> {
    table: Mutex<HandleTable<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            table: Mutex::new(HandleTable::new()),
        }
    }
}

impl<T> Registry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object.
    pub fn insert(&self, value: T) -> Handle<T> {
        self.table.lock().insert(value)
    }

    /// Register an already shared object.
    pub fn insert_arc(&self, value: Arc<T>) -> Handle<T> {
        self.table.lock().insert_arc(value)
    }

    /// Resolve a handle to a shared reference.
    pub fn get(&self, handle: Handle<T>) -> Result<Arc<T>> {
        self.table.lock().get(handle).cloned()
    }

    /// Whether the handle names a live object.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.table.lock().contains(handle)
    }

    /// Unregister an object, returning the last registry reference.
    pub fn remove(&self, handle: Handle<T>) -> Result<Arc<T>> {
        self.table.lock().remove(handle)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns true if no object is live.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Copy out every live handle and object.
    pub fn snapshot(&self) -> Vec<(Handle<T>, Arc<T>)> {
        self.table
            .lock()
            .iter()
            .map(|(handle, value)| (handle, Arc::clone(value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug)]
    struct Widget(u32);

    #[test]
    fn insert_and_resolve() {
        let mut table = HandleTable::new();
        let a = table.insert(Widget(1));
        let b = table.insert(Widget(2));

        assert_eq!(table.get(a).unwrap().0, 1);
        assert_eq!(table.get(b).unwrap().0, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut table = HandleTable::new();
        let old = table.insert(Widget(1));
        table.remove(old).unwrap();
        let new = table.insert(Widget(2));

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(matches!(
            table.get(old),
            Err(Error::InvalidHandle { kind: "Widget", .. })
        ));
        assert!(table.remove(old).is_err());
        assert_eq!(table.get(new).unwrap().0, 2);
    }

    #[test]
    fn raw_round_trip_and_null() {
        let mut table = HandleTable::new();
        let handle = table.insert(Widget(7));
        let raw = handle.to_raw();

        assert_ne!(raw, 0);
        assert_eq!(Handle::<Widget>::from_raw(raw), Some(handle));
        assert_eq!(Handle::<Widget>::from_raw(0), None);
    }

    #[test]
    fn iter_skips_removed() {
        let mut table = HandleTable::new();
        let a = table.insert(Widget(1));
        let _b = table.insert(Widget(2));
        table.remove(a).unwrap();

        let values: Vec<u32> = table.iter().map(|(_, w)| w.0).collect();
        assert_eq!(values, vec![2]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn registry_serializes_concurrent_create_destroy() {
        let registry = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..200 {
                        let handle = registry.insert(Widget(t * 1000 + i));
                        assert_eq!(registry.get(handle).unwrap().0, t * 1000 + i);
                        if i % 2 == 0 {
                            registry.remove(handle).unwrap();
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 100);
    }
}
