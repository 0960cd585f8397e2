//! Table of requests awaiting a backend response.
//!
//! Entries are keyed by the rewritten sequence id and ordered by age. The
//! age index is keyed by start instant and insertion counter, so expiry
//! is a prefix cut even when entries arrive out of age order.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::warn;
use tokio::time::Instant;

use crate::request::InFlight;

/// Default number of entries a table holds before evicting the oldest.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Entries that know when they started.
pub trait Aged {
    /// Start of the entry's lifetime.
    fn started_at(&self) -> Instant;
}

impl Aged for InFlight {
    fn started_at(&self) -> Instant { self.request().start() }
}

type AgeKey = (Instant, u64);

struct Slot<T> {
    age: AgeKey,
    entry: T,
}

struct Inner<T> {
    entries: HashMap<i32, Slot<T>>,
    by_age: BTreeMap<AgeKey, i32>,
    counter: u64,
}

impl<T> Inner<T> {
    fn remove(&mut self, id: i32) -> Option<T> {
        let slot = self.entries.remove(&id)?;
        self.by_age.remove(&slot.age);
        Some(slot.entry)
    }

    fn pop_oldest(&mut self) -> Option<T> {
        let (_, id) = self.by_age.pop_first()?;
        self.entries.remove(&id).map(|slot| slot.entry)
    }
}

/// Sequence id to in-flight entry map, oldest first.
///
/// Every operation takes the table's lock, so the write loop, the read
/// loop and the expiry sweep may share one table.
pub struct PendingTable<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T: Aged> Default for PendingTable<T> {
    fn default() -> Self { Self::with_capacity(DEFAULT_CAPACITY) }
}

impl<T: Aged> PendingTable<T> {
    /// Create a table with the default capacity.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Create a table holding at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                by_age: BTreeMap::new(),
                counter: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `entry` under `id`.
    ///
    /// A duplicate id is a protocol violation: it is logged, the new entry
    /// takes the most recent position and the displaced entry is returned.
    /// When the table is full the oldest entry is evicted and returned.
    /// Either way the caller must complete what comes back.
    pub fn insert(&self, id: i32, entry: T) -> Option<T> {
        let mut inner = self.lock();
        let displaced = inner.remove(id);
        if displaced.is_some() {
            warn!("duplicate pending sequence id: id={id}");
        }
        let evicted = if displaced.is_none() && inner.entries.len() >= self.capacity {
            let evicted = inner.pop_oldest();
            warn!("pending table full, evicting oldest entry: capacity={}", self.capacity);
            evicted
        } else {
            None
        };
        inner.counter += 1;
        let age = (entry.started_at(), inner.counter);
        inner.by_age.insert(age, id);
        inner.entries.insert(id, Slot { age, entry });
        displaced.or(evicted)
    }

    /// Remove and return the entry under `id`.
    pub fn pop(&self, id: i32) -> Option<T> { self.lock().remove(id) }

    /// Inspect the entry under `id` without removing it.
    pub fn get<R>(&self, id: i32, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().entries.get(&id).map(|slot| f(&slot.entry))
    }

    /// Whether an entry is recorded under `id`.
    #[must_use]
    pub fn contains(&self, id: i32) -> bool { self.lock().entries.contains_key(&id) }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().entries.len() }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().entries.is_empty() }

    /// Recorded ids, oldest first.
    #[must_use]
    pub fn keys(&self) -> Vec<i32> { self.lock().by_age.values().copied().collect() }

    /// Id of the oldest entry.
    #[must_use]
    pub fn peek_oldest(&self) -> Option<i32> {
        self.lock().by_age.first_key_value().map(|(_, id)| *id)
    }

    /// Remove every entry started at or before `cutoff`, oldest first.
    pub fn remove_expired(&self, cutoff: Instant) -> Vec<T> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        while inner
            .by_age
            .first_key_value()
            .is_some_and(|((start, _), _)| *start <= cutoff)
        {
            if let Some(entry) = inner.pop_oldest() {
                expired.push(entry);
            }
        }
        expired
    }

    /// Empty the table, returning every entry oldest first.
    pub fn purge(&self) -> Vec<T> {
        let mut inner = self.lock();
        let by_age = std::mem::take(&mut inner.by_age);
        let mut entries = std::mem::take(&mut inner.entries);
        by_age
            .into_values()
            .filter_map(|id| entries.remove(&id).map(|slot| slot.entry))
            .collect()
    }
}
