use std::{fmt, marker::PhantomData, mem};

use derive_where::derive_where;
use serde::{Deserialize, Serialize};

const SLOT_BITS: u32 = 24;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// Maximum number of slots that can be addressed by a [`Handle`].
pub const MAX_SLOTS: usize = SLOT_MASK as usize + 1;

/// Returns the generation that follows `generation`.
///
/// Generation `0` is skipped when wrapping so that the raw value `0` never packs a live handle.
pub fn next_generation(generation: u8) -> u8 {
    match generation {
        u8::MAX => 1,
        generation => generation + 1,
    }
}

/// Packs an 8-bit generation and a 24-bit slot index into one `u32`.
///
/// A `Handle` doesn't own anything. It is a weak reference that is only valid as long as
/// the generation stored in the [`SlotArena`] for its slot matches its own generation.
#[derive_where(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle<T> {
    raw: u32,
    #[serde(skip)]
    phantom_data: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Creates a new `Handle` from the given `generation` and `slot`.
    ///
    /// # Panics
    ///
    /// If `slot` doesn't fit into 24 bits.
    pub fn new(generation: u8, slot: usize) -> Self {
        assert!(slot < MAX_SLOTS, "slot {slot} doesn't fit into a handle");
        Self::from_raw(((generation as u32) << SLOT_BITS) | slot as u32)
    }

    /// Handle that never refers to a live slot.
    pub const fn null() -> Self {
        Self {
            raw: 0,
            phantom_data: PhantomData,
        }
    }

    /// Recreates a `Handle` from its packed representation.
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            phantom_data: PhantomData,
        }
    }

    /// Returns the packed representation.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Returns the slot index of the handle.
    pub fn slot(&self) -> usize {
        (self.raw & SLOT_MASK) as usize
    }

    /// Returns the generation of the handle.
    pub fn generation(&self) -> u8 {
        (self.raw >> SLOT_BITS) as u8
    }

    pub fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Reinterprets the handle as a handle of another type.
    pub fn cast<U>(self) -> Handle<U> {
        Handle::from_raw(self.raw)
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.slot(), self.generation())
    }
}

struct Slot<T> {
    generation: u8,
    deleted: bool,
    value: T,
}

/// Arena of slots that are addressed by generation-checked [`Handle`]s.
///
/// Removed slots are marked as deleted and reused by the next insertion. The generation of
/// a slot is bumped on both insertion and removal, so every handle that was given out for a
/// previous occupant is stale afterwards.
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotArena<T> {
    /// Creates a new empty arena.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Returns whether the handle refers to the current occupant of its slot.
    pub fn is_live(&self, handle: &Handle<T>) -> bool {
        self.slots
            .get(handle.slot())
            .map_or(false, |slot| !slot.deleted && slot.generation == handle.generation())
    }

    /// Returns a reference to the element at the given handle.
    pub fn get(&self, handle: &Handle<T>) -> Option<&T> {
        if self.is_live(handle) {
            Some(&self.slots[handle.slot()].value)
        } else {
            None
        }
    }

    /// Returns a mutable reference to the element at the given handle.
    pub fn get_mut(&mut self, handle: &Handle<T>) -> Option<&mut T> {
        if self.is_live(handle) {
            Some(&mut self.slots[handle.slot()].value)
        } else {
            None
        }
    }

    /// Returns the current generation of the given slot.
    pub fn generation_of(&self, slot: usize) -> Option<u8> {
        self.slots.get(slot).map(|slot| slot.generation)
    }

    /// Returns the number of live elements in the arena.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.deleted).count()
    }

    /// Returns whether there are no live elements in the arena.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of slots including the deleted ones.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over the live elements.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.deleted)
            .map(|(index, slot)| (Handle::new(slot.generation, index), &slot.value))
    }
}

impl<T: Default> SlotArena<T> {
    /// Returns the index of the first deleted slot or grows the arena by one.
    ///
    /// Churn is expected to be low so that the linear scan is acceptable.
    fn allocate_slot(&mut self) -> usize {
        if let Some(index) = self.slots.iter().position(|slot| slot.deleted) {
            index
        } else {
            assert!(self.slots.len() < MAX_SLOTS, "SlotArena is out of slots");
            self.slots.push(Slot {
                generation: 0,
                deleted: true,
                value: T::default(),
            });
            self.slots.len() - 1
        }
    }

    /// Inserts a new element into the arena.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let index = self.allocate_slot();
        let slot = &mut self.slots[index];
        slot.generation = next_generation(slot.generation);
        slot.deleted = false;
        slot.value = value;
        Handle::new(slot.generation, index)
    }

    /// Inserts the element exactly at the slot and generation of the given handle.
    ///
    /// Returns `false` when the slot is occupied. This is used to restore handles that
    /// were persisted in a previous session.
    pub fn insert_at(&mut self, handle: Handle<T>, value: T) -> bool {
        if handle.is_null() {
            return false;
        }
        while self.slots.len() <= handle.slot() {
            self.slots.push(Slot {
                generation: 0,
                deleted: true,
                value: T::default(),
            });
        }
        let slot = &mut self.slots[handle.slot()];
        if !slot.deleted {
            return false;
        }
        slot.generation = handle.generation();
        slot.deleted = false;
        slot.value = value;
        true
    }

    /// Removes the element at the given handle and returns it.
    pub fn remove(&mut self, handle: &Handle<T>) -> Option<T> {
        if !self.is_live(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.slot()];
        slot.generation = next_generation(slot.generation);
        slot.deleted = true;
        Some(mem::take(&mut slot.value))
    }
}
