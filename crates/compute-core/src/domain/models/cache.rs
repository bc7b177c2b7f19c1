//! Bounded LRU cache of loaded models

use std::collections::HashMap;

use api_types::ComputeDevice;
use api_types::ModelInfo;
use chrono::DateTime;
use chrono::Utc;

use super::loader::ModelHandle;

#[derive(Debug, Clone)]
pub struct ModelCacheEntry {
    pub handle: ModelHandle,
    pub model_info: ModelInfo,
    pub device: ComputeDevice,
    pub memory_used: u64,
    /// GPU allocation backing this entry; `None` when resident on the CPU
    pub allocation_id: Option<String>,
    pub loaded_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    recency: u64,
}

impl ModelCacheEntry {
    pub fn new(
        handle: ModelHandle,
        model_info: ModelInfo,
        device: ComputeDevice,
        memory_used: u64,
        allocation_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            handle,
            model_info,
            device,
            memory_used,
            allocation_id,
            loaded_at: now,
            last_accessed: now,
            access_count: 1,
            recency: 0,
        }
    }
}

/// Recency is tracked with a monotonic tick rather than timestamps, so two
/// accesses within the same clock instant still order correctly.
#[derive(Debug)]
pub struct ModelCache {
    entries: HashMap<String, ModelCacheEntry>,
    capacity: usize,
    tick: u64,
}

impl ModelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.entries.contains_key(model_id)
    }

    /// Look up without changing recency.
    pub fn peek(&self, model_id: &str) -> Option<&ModelCacheEntry> {
        self.entries.get(model_id)
    }

    /// Look up and mark as most recently used.
    pub fn touch(&mut self, model_id: &str, now: DateTime<Utc>) -> Option<&ModelCacheEntry> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(model_id)?;
        entry.recency = tick;
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(entry)
    }

    /// Insert as most recently used. Callers evict first when full.
    pub fn insert(&mut self, mut entry: ModelCacheEntry) {
        self.tick += 1;
        entry.recency = self.tick;
        self.entries.insert(entry.model_info.model_id.clone(), entry);
    }

    pub fn remove(&mut self, model_id: &str) -> Option<ModelCacheEntry> {
        self.entries.remove(model_id)
    }

    pub fn lru_id(&self) -> Option<String> {
        self.entries
            .values()
            .min_by_key(|entry| entry.recency)
            .map(|entry| entry.model_info.model_id.clone())
    }

    pub fn mru_id(&self) -> Option<String> {
        self.entries
            .values()
            .max_by_key(|entry| entry.recency)
            .map(|entry| entry.model_info.model_id.clone())
    }

    pub fn pop_lru(&mut self) -> Option<ModelCacheEntry> {
        let model_id = self.lru_id()?;
        self.entries.remove(&model_id)
    }

    /// Remove the least recently used entry among those matching `filter`.
    pub fn pop_lru_where(
        &mut self,
        filter: impl Fn(&ModelCacheEntry) -> bool,
    ) -> Option<ModelCacheEntry> {
        let model_id = self
            .entries
            .values()
            .filter(|entry| filter(entry))
            .min_by_key(|entry| entry.recency)
            .map(|entry| entry.model_info.model_id.clone())?;
        self.entries.remove(&model_id)
    }

    pub fn drain(&mut self) -> Vec<ModelCacheEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// Entries from most to least recently used.
    pub fn entries_by_recency(&self) -> Vec<&ModelCacheEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.recency));
        entries
    }
}
