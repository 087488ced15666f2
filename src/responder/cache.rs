use std::collections::{HashMap, VecDeque};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::prompting::MemoryContext;

/// What goes into a cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyScope {
    /// Raw user input only: the same words under different memories share an answer.
    #[default]
    InputOnly,
    /// User input plus every memory fact, in order.
    InputAndMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_input(user_input: &str) -> Self {
        Self(Sha256::digest(user_input.as_bytes()).into())
    }

    pub fn of_turn(user_input: &str, memory: Option<&MemoryContext>, scope: CacheKeyScope) -> Self {
        match scope {
            CacheKeyScope::InputOnly => Self::of_input(user_input),
            CacheKeyScope::InputAndMemory => {
                let mut hasher = Sha256::new();
                hasher.update(user_input.as_bytes());
                hasher.update([0u8]);
                for (label, fact) in memory.into_iter().flat_map(|m| m.iter()) {
                    hasher.update(label.as_bytes());
                    hasher.update([0x1f]);
                    hasher.update(fact.as_bytes());
                    hasher.update([0x1e]);
                }
                Self(hasher.finalize().into())
            }
        }
    }
}

/// Bounded response cache with first-in-first-out eviction.
///
/// Lookups never reorder entries: an entry leaves the cache exactly when it
/// is the oldest insertion and a new one arrives at capacity. A capacity of
/// zero stores nothing.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    entries: HashMap<Fingerprint, String>,
    order: VecDeque<Fingerprint>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the evicted key, if any. Overwriting a held key keeps its slot.
    pub fn insert(&mut self, key: Fingerprint, response: String) -> Option<Fingerprint> {
        if self.capacity == 0 {
            return None;
        }
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = response;
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        self.order.push_back(key);
        self.entries.insert(key, response);
        evicted
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

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
