//! In-process cache of preprocessed datasets.
//!
//! Preprocessing output is memoised by dataset fingerprint so repeated
//! training/evaluation runs in one process skip the work. Building a model
//! invalidates the cache once, because preprocessing depends on the model's
//! features; the owner of the cache hands it to the model explicitly rather
//! than relying on a process-global.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// A preprocessed dataset held by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedDataset {
    pub fingerprint: String,
    pub path: PathBuf,
    pub num_rows: usize,
}

/// Shared, clonable handle to the dataset cache.
#[derive(Debug, Clone, Default)]
pub struct DataCache {
    entries: Arc<Mutex<HashMap<String, CachedDataset>>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedDataset>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, dataset: CachedDataset) {
        self.lock().insert(dataset.fingerprint.clone(), dataset);
    }

    pub fn get(&self, fingerprint: &str) -> Option<CachedDataset> {
        self.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let removed = entries.len();
        entries.clear();
        tracing::debug!(removed, "Cleared data cache");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(fp: &str) -> CachedDataset {
        CachedDataset {
            fingerprint: fp.into(),
            path: PathBuf::from(format!("/tmp/{fp}.parquet")),
            num_rows: 10,
        }
    }

    #[test]
    fn test_insert_get_clear() {
        let cache = DataCache::new();
        assert!(cache.is_empty());
        cache.insert(dataset("a1"));
        cache.insert(dataset("b2"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a1").unwrap().num_rows, 10);
        assert!(cache.get("zz").is_none());

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.clear(), 0);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = DataCache::new();
        let handle = cache.clone();
        handle.insert(dataset("shared"));
        assert!(cache.get("shared").is_some());
        cache.clear();
        assert!(handle.is_empty());
    }
}
