//! Bounded memo of analyses.
//!
//! Entries remember which version of their artifact they were computed from:
//! the service-side epoch, bumped whenever the service replaces a graph, and
//! the store's change stamp, which also catches rewrites by other processes.
//! A lookup that finds an entry for an older version drops it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::domain::analysis::{AnalysisKey, AnalyzedGraph};
use crate::ports::ArtifactStamp;

pub const DEFAULT_CAPACITY: usize = 32;

type CacheKey = (String, AnalysisKey);

struct Entry {
    graph: Arc<AnalyzedGraph>,
    epoch: u64,
    stamp: Option<ArtifactStamp>,
    last_used: AtomicU64,
}

pub struct AnalysisCache {
    capacity: usize,
    entries: DashMap<CacheKey, Entry>,
    epochs: DashMap<String, u64>,
    clock: AtomicU64,
}

impl AnalysisCache {
    /// A cache holding at most `capacity` analyses (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            epochs: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current epoch of `id`; read it before loading the artifact.
    pub fn epoch(&self, id: &str) -> u64 {
        self.epochs.get(id).map(|e| *e.value()).unwrap_or(0)
    }

    /// The analysis for `key`, if it was computed from the current version.
    pub fn get(&self, id: &str, key: &AnalysisKey, stamp: Option<ArtifactStamp>) -> Option<Arc<AnalyzedGraph>> {
        let epoch = self.epoch(id);
        let key = (id.to_string(), *key);
        let hit = self.entries.get(&key).and_then(|entry| {
            if entry.epoch == epoch && entry.stamp == stamp {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                Some(Arc::clone(&entry.graph))
            } else {
                None
            }
        });
        if hit.is_none() {
            let dropped = self
                .entries
                .remove_if(&key, |_, entry| entry.epoch != epoch || entry.stamp != stamp);
            if dropped.is_some() {
                debug!(graph = id, "dropped outdated analysis");
            }
        }
        hit
    }

    /// Remember an analysis computed at `epoch` from an artifact stamped `stamp`.
    ///
    /// Ignored if the graph was replaced since `epoch` was read.
    pub fn insert(
        &self,
        id: &str,
        key: &AnalysisKey,
        graph: Arc<AnalyzedGraph>,
        epoch: u64,
        stamp: Option<ArtifactStamp>,
    ) {
        if epoch != self.epoch(id) {
            debug!(graph = id, "not caching analysis of a replaced graph");
            return;
        }
        self.entries.insert(
            (id.to_string(), *key),
            Entry {
                graph,
                epoch,
                stamp,
                last_used: AtomicU64::new(self.tick()),
            },
        );
        self.evict();
    }

    /// Forget every analysis of `id` and reject those still being computed.
    pub fn invalidate(&self, id: &str) {
        *self.epochs.entry(id.to_string()).or_insert(0) += 1;
        self.entries.retain(|(cached, _), _| cached != id);
    }

    /// Keep analyses of the listed graphs only.
    pub fn retain_graphs(&self, ids: &BTreeSet<String>) {
        self.entries.retain(|(cached, _), _| ids.contains(cached));
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop least recently used entries above capacity.
    fn evict(&self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.last_used.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
