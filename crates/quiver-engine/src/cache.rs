//! Shared computation cache.
//!
//! Maps value specifications to computed values. Invokers read inputs from
//! it, the invocation receiver writes outputs into it, and the executor
//! snapshots it to decide which nodes are already satisfied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use quiver_traits::{CacheMode, ComputedValue, Value, ValueSpecification};

/// Concurrent value store keyed by specification.
///
/// `put` is last-write-wins and atomic per key; `get` never blocks on writers
/// of other keys.
pub struct ComputationCache {
    values: DashMap<ValueSpecification, Value>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Lookups for absent specifications.
    pub misses: u64,
    /// Writes.
    pub puts: u64,
}

impl ComputationCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Store a value.
    pub fn put(&self, specification: ValueSpecification, value: Value) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.values.insert(specification, value);
    }

    /// Store a batch of computed values.
    pub fn put_all(&self, values: impl IntoIterator<Item = ComputedValue>) {
        for computed in values {
            self.put(computed.specification, computed.value);
        }
    }

    /// Store a batch of values and return the specifications whose value
    /// differs from what the cache held, including new ones.
    pub fn put_changed(
        &self,
        values: impl IntoIterator<Item = ComputedValue>,
    ) -> HashSet<ValueSpecification> {
        let mut changed = HashSet::new();
        for computed in values {
            self.puts.fetch_add(1, Ordering::Relaxed);
            let previous = self
                .values
                .insert(computed.specification.clone(), computed.value.clone());
            if previous.as_ref() != Some(&computed.value) {
                changed.insert(computed.specification);
            }
        }
        changed
    }

    /// Drop one entry.
    pub fn remove(&self, specification: &ValueSpecification) -> Option<Value> {
        self.values.remove(specification).map(|(_, value)| value)
    }

    /// Look up a value.
    pub fn get(&self, specification: &ValueSpecification) -> Option<Value> {
        match self.values.get(specification) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up a batch of values. Absent specifications are omitted.
    pub fn get_all<'a>(
        &self,
        specifications: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> HashMap<ValueSpecification, Value> {
        specifications
            .into_iter()
            .filter_map(|spec| self.get(spec).map(|v| (spec.clone(), v)))
            .collect()
    }

    /// Check presence without touching the hit counters.
    pub fn contains(&self, specification: &ValueSpecification) -> bool {
        self.values.contains_key(specification)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.values.clear();
    }

    /// Apply the cycle boundary for the given mode.
    ///
    /// Scoped caches are cleared; incremental caches keep prior-cycle entries
    /// so they act as pre-satisfied inputs.
    pub fn begin_cycle(&self, mode: CacheMode) {
        match mode {
            CacheMode::Scoped => self.clear(),
            CacheMode::Incremental => {}
        }
    }

    /// Point-in-time copy of the entries.
    pub fn snapshot(&self) -> CacheSnapshot {
        let values = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        CacheSnapshot { values }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.values.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
        }
    }
}

impl Default for ComputationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of the cache taken at the start of an execution.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    values: HashMap<ValueSpecification, Value>,
}

impl CacheSnapshot {
    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if the specification was present.
    pub fn contains(&self, specification: &ValueSpecification) -> bool {
        self.values.contains_key(specification)
    }

    /// Value at snapshot time.
    pub fn get(&self, specification: &ValueSpecification) -> Option<&Value> {
        self.values.get(specification)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<ComputedValue> for CacheSnapshot {
    fn from_iter<I: IntoIterator<Item = ComputedValue>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|c| (c.specification, c.value))
                .collect(),
        }
    }
}
