use std::{cmp::Ordering, mem};

use allocator_api2::{
    alloc::{Allocator, Global},
    vec::Vec,
};
use hashbrown::{hash_map::RawEntryMut, HashMap};

use crate::metrics::text::MetricsString;

/// Records keyed by name. Keys and buckets both come out of `A`.
pub struct MetricsTable<R, A: Allocator + Clone = Global> {
    entries: HashMap<MetricsString<A>, R, ahash::RandomState, A>,
}

impl<R> MetricsTable<R, Global> {
    pub fn new() -> Self {
        Self::new_in(Global)
    }
}

impl<R> Default for MetricsTable<R, Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, A: Allocator + Clone> MetricsTable<R, A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            entries: HashMap::with_hasher_in(ahash::RandomState::new(), alloc),
        }
    }

    /// Store `record` under `name`, handing back whatever was there
    pub fn set(&mut self, name: &str, record: R) -> Option<R> {
        let alloc = self.entries.allocator().clone();
        match self.entries.raw_entry_mut().from_key(name) {
            RawEntryMut::Occupied(mut entry) => Some(mem::replace(entry.get_mut(), record)),
            RawEntryMut::Vacant(entry) => {
                entry.insert(MetricsString::from_str_in(name, alloc), record);
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&R> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut R> {
        self.entries.get_mut(name)
    }

    /// The record for `name`, inserting `make()` first if there isn't one
    pub fn get_or_insert_with(&mut self, name: &str, make: impl FnOnce() -> R) -> &mut R {
        let alloc = self.entries.allocator().clone();
        match self.entries.raw_entry_mut().from_key(name) {
            RawEntryMut::Occupied(entry) => entry.into_mut(),
            RawEntryMut::Vacant(entry) => entry.insert(MetricsString::from_str_in(name, alloc), make()).1,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<R> {
        self.entries.remove(name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &R)> {
        self.entries.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut R)> {
        self.entries.iter_mut().map(|(name, record)| (name.as_str(), record))
    }

    /// Every entry, ordered by name
    pub fn sorted(&self) -> Vec<(&str, &R), A> {
        self.sorted_by(|(a, _), (b, _)| a.cmp(b))
    }

    pub fn sorted_by<F>(&self, mut compare: F) -> Vec<(&str, &R), A>
    where
        F: FnMut((&str, &R), (&str, &R)) -> Ordering,
    {
        let mut sorted = Vec::with_capacity_in(self.len(), self.entries.allocator().clone());
        sorted.extend(self.iter());
        sorted.sort_by(|a, b| compare(*a, *b));
        sorted
    }

    pub fn allocator(&self) -> &A {
        self.entries.allocator()
    }
}
