//! Content-addressed completion cache.
//!
//! Keys are a sha-256 over (model, system text, user text, normalized
//! options). The in-memory tier is a sharded LRU; an optional directory
//! mirror persists entries as one JSON file per key so a warm cache
//! survives restarts. Entries carry the full token accounting so cache hits
//! still contribute accurate costs.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::TokenUsage;

const SHARDS: usize = 16;

/// Cached completion payload with its original accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Stable cache key for one call.
pub fn cache_key(model: &str, system: &str, user: &str, normalized_options: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(system.as_bytes());
    hasher.update([0]);
    hasher.update(user.as_bytes());
    hasher.update([0]);
    hasher.update(normalized_options.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, CachedCompletion>,
    // Front is least recently used.
    order: VecDeque<String>,
}

impl Shard {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// Sharded LRU with an optional disk mirror.
pub struct CompletionCache {
    shards: Vec<Mutex<Shard>>,
    per_shard_capacity: usize,
    dir: Option<PathBuf>,
}

impl CompletionCache {
    pub fn new(max_entries: usize, dir: Option<&Path>) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(Shard::default())).collect();
        if let Some(dir) = dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "llm cache dir unavailable, memory only");
            }
        }
        Self {
            shards,
            per_shard_capacity: (max_entries / SHARDS).max(1),
            dir: dir.map(Path::to_path_buf),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        // Keys are hex sha-256, so the first byte is uniformly distributed.
        let idx = usize::from_str_radix(&key[..2], 16).unwrap_or(0) % SHARDS;
        &self.shards[idx]
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{key}.json")))
    }

    pub fn get(&self, key: &str) -> Option<CachedCompletion> {
        {
            let mut shard = self.shard_for(key).lock();
            if let Some(hit) = shard.entries.get(key).cloned() {
                shard.touch(key);
                return Some(hit);
            }
        }
        // Memory miss; try the disk mirror and promote.
        let path = self.disk_path(key)?;
        let bytes = std::fs::read(path).ok()?;
        let entry: CachedCompletion = serde_json::from_slice(&bytes).ok()?;
        self.insert_memory(key, entry.clone());
        Some(entry)
    }

    pub fn put(&self, key: &str, entry: CachedCompletion) {
        if let Some(path) = self.disk_path(key) {
            match serde_json::to_vec_pretty(&entry) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&path, bytes) {
                        tracing::warn!(error = %e, "failed to mirror completion to disk");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize cached completion"),
            }
        }
        self.insert_memory(key, entry);
    }

    fn insert_memory(&self, key: &str, entry: CachedCompletion) {
        let mut shard = self.shard_for(key).lock();
        shard.entries.insert(key.to_string(), entry);
        shard.touch(key);
        while shard.entries.len() > self.per_shard_capacity {
            if let Some(evicted) = shard.order.pop_front() {
                shard.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str) -> CachedCompletion {
        CachedCompletion {
            text: text.to_string(),
            model: "m".to_string(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            cost_usd: 0.001,
        }
    }

    #[test]
    fn test_key_is_stable_and_sensitive() {
        let a = cache_key("m", "s", "u", "t=0.200;max=1024;fmt=text;salt=");
        let b = cache_key("m", "s", "u", "t=0.200;max=1024;fmt=text;salt=");
        let c = cache_key("m", "s", "u2", "t=0.200;max=1024;fmt=text;salt=");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_memory_round_trip_and_eviction() {
        // Capacity of 16 gives one slot per shard.
        let cache = CompletionCache::new(16, None);
        let k1 = cache_key("m", "s", "u1", "o");
        cache.put(&k1, entry("one"));
        assert_eq!(cache.get(&k1).unwrap().text, "one");

        // Fill the same shard until k1 is evicted.
        let mut evicted = false;
        for i in 0..200 {
            let k = cache_key("m", "s", &format!("u{i}"), "o");
            cache.put(&k, entry("x"));
        }
        if cache.get(&k1).is_none() {
            evicted = true;
        }
        assert!(evicted, "LRU should have evicted the oldest entry");
    }

    #[test]
    fn test_disk_mirror_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        let key = cache_key("m", "s", "u", "o");
        {
            let cache = CompletionCache::new(64, Some(dir.path()));
            cache.put(&key, entry("persisted"));
        }
        // Fresh cache, cold memory: the disk mirror must serve the entry.
        let cache = CompletionCache::new(64, Some(dir.path()));
        assert_eq!(cache.get(&key).unwrap().text, "persisted");
    }
}
