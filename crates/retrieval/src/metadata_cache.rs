//! Cross-task paper metadata cache.
//!
//! Read-mostly; entries expire on a per-entry deadline and are evicted
//! lazily on lookup. Independent of any task lifetime.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use scholarqa_core::{CorpusId, PaperRecord};

pub struct MetadataCache {
    entries: DashMap<CorpusId, (PaperRecord, Instant)>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, corpus_id: &str) -> Option<PaperRecord> {
        if let Some(entry) = self.entries.get(corpus_id) {
            let (record, deadline) = entry.value();
            if Instant::now() < *deadline {
                return Some(record.clone());
            }
        }
        // Expired or absent; drop any stale entry.
        self.entries
            .remove_if(corpus_id, |_, (_, deadline)| Instant::now() >= *deadline);
        None
    }

    pub fn insert(&self, record: PaperRecord) {
        let deadline = Instant::now() + self.ttl;
        self.entries
            .insert(record.corpus_id.clone(), (record, deadline));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
