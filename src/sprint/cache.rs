//! Per-run lookup caches for sprint and status category metadata.
//!
//! Caches live for one batch run and are dropped with it. Entries never
//! expire; the oldest insertion is evicted once capacity is reached.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use tracing::trace;

use crate::error::Result;
use crate::model::Sprint;
use crate::storage::MetadataStore;

/// Fixed-capacity map evicting in insertion order.
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Insert or overwrite. Overwriting keeps the original insertion slot.
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

type SprintKey = (String, String, String);
type StatusKey = (String, String);

/// Sprint and status category memoization for one batch run.
///
/// Misses are cached too, so an unknown sprint is looked up once per run.
#[derive(Debug, Clone)]
pub struct LookupCaches {
    sprints: BoundedCache<SprintKey, Option<Sprint>>,
    status_categories: BoundedCache<StatusKey, Option<String>>,
    hits: u64,
    misses: u64,
}

impl LookupCaches {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sprints: BoundedCache::new(capacity),
            status_categories: BoundedCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Resolve a sprint through the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store lookup fails; failures are not cached.
    pub fn sprint<M>(
        &mut self,
        metadata: &M,
        integration_id: &str,
        parent_key: &str,
        name: &str,
    ) -> Result<Option<Sprint>>
    where
        M: MetadataStore + ?Sized,
    {
        let key = (
            integration_id.to_string(),
            parent_key.to_string(),
            name.to_string(),
        );
        if let Some(cached) = self.sprints.get(&key) {
            self.hits += 1;
            return Ok(cached.clone());
        }
        self.misses += 1;
        let sprint = metadata.resolve_sprint(integration_id, parent_key, name)?;
        trace!(parent_key, name, found = sprint.is_some(), "sprint lookup");
        self.sprints.insert(key, sprint.clone());
        Ok(sprint)
    }

    /// Resolve a status category through the cache. Status matching ignores case.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store lookup fails; failures are not cached.
    pub fn status_category<M>(
        &mut self,
        metadata: &M,
        integration_id: &str,
        status: &str,
    ) -> Result<Option<String>>
    where
        M: MetadataStore + ?Sized,
    {
        let key = (integration_id.to_string(), status.trim().to_lowercase());
        if let Some(cached) = self.status_categories.get(&key) {
            self.hits += 1;
            return Ok(cached.clone());
        }
        self.misses += 1;
        let category = metadata.resolve_status_category(integration_id, status)?;
        trace!(status, category = ?category, "status category lookup");
        self.status_categories.insert(key, category.clone());
        Ok(category)
    }

    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }
}
