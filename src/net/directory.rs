// src/net/directory.rs - Generation-counted session directory
//
// One directory per worker loop. Slots come from a slab (freed slots are
// reused before the slab grows) and every slot carries a generation that is
// bumped on removal, so an id minted for a previous occupant never resolves
// to the new one.
//
// A directory is owned by its EventLoop and only ever touched from that
// loop's thread.

use crate::error::{Error, Result};
use crate::net::session_id::MAX_SESSIONS_PER_LOOP;

const INITIAL_GENERATION: u32 = 1;

/// Position of a live entry: slot index plus the generation it was stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub index: u16,
    pub generation: u32,
}

pub struct SessionDirectory<T> {
    entries: slab::Slab<T>,
    /// Current generation of every slot ever handed out
    generations: Vec<u32>,
    capacity: usize,
}

impl<T> SessionDirectory<T> {
    /// Create a directory holding at most `capacity` live entries
    /// (clamped to `1..=MAX_SESSIONS_PER_LOOP`).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_SESSIONS_PER_LOOP);
        Self {
            entries: slab::Slab::with_capacity(capacity.min(1024)),
            generations: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn insert(&mut self, value: T) -> Result<Slot> {
        self.insert_with(|_| value)
    }

    /// Store the value built by `make` in a free slot.
    ///
    /// `make` receives the slot it will live in, so the value can embed its
    /// own session id. When the directory is full `make` is never called.
    pub fn insert_with<F>(&mut self, make: F) -> Result<Slot>
    where
        F: FnOnce(Slot) -> T,
    {
        if self.entries.len() >= self.capacity {
            return Err(Error::DirectoryFull {
                capacity: self.capacity,
            });
        }

        let entry = self.entries.vacant_entry();
        let key = entry.key();
        let index = u16::try_from(key).map_err(|_| Error::DirectoryFull {
            capacity: self.capacity,
        })?;

        if key == self.generations.len() {
            self.generations.push(INITIAL_GENERATION);
        }
        let slot = Slot {
            index,
            generation: self.generations[key],
        };

        entry.insert(make(slot));
        Ok(slot)
    }

    pub fn resolve(&self, slot: Slot) -> Option<&T> {
        if self.generation(slot.index)? != slot.generation {
            return None;
        }
        self.entries.get(slot.index as usize)
    }

    pub fn resolve_mut(&mut self, slot: Slot) -> Option<&mut T> {
        if self.generation(slot.index)? != slot.generation {
            return None;
        }
        self.entries.get_mut(slot.index as usize)
    }

    /// Clear the slot and bump its generation.
    pub fn remove(&mut self, index: u16) -> Option<T> {
        let value = self.entries.try_remove(index as usize)?;
        let generation = &mut self.generations[index as usize];
        *generation = generation.wrapping_add(1);
        if *generation == 0 {
            *generation = INITIAL_GENERATION;
        }
        Some(value)
    }

    /// Generation a new occupant of `index` would get (or the live one's).
    pub fn generation(&self, index: u16) -> Option<u32> {
        self.generations.get(index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> + '_ {
        let generations = &self.generations;
        self.entries.iter().map(move |(key, value)| {
            (
                Slot {
                    index: key as u16,
                    generation: generations[key],
                },
                value,
            )
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Slot, &mut T)> + '_ {
        let generations = &self.generations;
        self.entries.iter_mut().map(move |(key, value)| {
            (
                Slot {
                    index: key as u16,
                    generation: generations[key],
                },
                value,
            )
        })
    }

    /// Remove every entry (bumping generations), handing them to the caller.
    pub fn drain(&mut self) -> Vec<T> {
        let indices: Vec<u16> = self.entries.iter().map(|(key, _)| key as u16).collect();
        indices
            .into_iter()
            .filter_map(|index| self.remove(index))
            .collect()
    }
}
