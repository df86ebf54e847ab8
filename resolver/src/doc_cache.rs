use crate::error::ResolverError;
use crate::error::Result;
use crate::model::FileId;
use crate::slot::OutcomeCell;
use crate::store::DocumentStore;
use crate::store::ParsedDocument;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

type LoadOutcome = std::result::Result<Arc<ParsedDocument>, String>;

struct CachedDocument {
    doc: Arc<ParsedDocument>,
    loaded_at: Instant,
    modified: Option<SystemTime>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DocumentCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub loads: u64,
    pub evictions: u64,
}

/// Bounded cache of opened documents with TTL and modification-time
/// invalidation. Concurrent misses for one file share a single load.
#[derive(Clone)]
pub struct ParsedDocumentCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
    entries: Mutex<LruCache<FileId, CachedDocument>>,
    loading: Mutex<HashMap<FileId, Arc<OutcomeCell<LoadOutcome>>>>,
    hits: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl ParsedDocumentCache {
    pub fn new(store: Arc<dyn DocumentStore>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                store,
                ttl,
                entries: Mutex::new(LruCache::new(capacity)),
                loading: Mutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                loads: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// Returns the cached document or loads it. The load runs on its own task,
    /// so a caller that stops waiting does not strand the others.
    pub async fn acquire(&self, id: &FileId) -> Result<Arc<ParsedDocument>> {
        if let Some(doc) = self.lookup(id) {
            return Ok(doc);
        }

        let (cell, owner) = {
            let mut loading = lock(&self.inner.loading);
            match loading.get(id) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(OutcomeCell::new());
                    loading.insert(id.clone(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        let waiter = cell.waiter();

        if owner {
            // A load may have finished between the lookup and taking the slot.
            if let Some(doc) = self.lookup(id) {
                cell.complete(Ok(Arc::clone(&doc)));
                lock(&self.inner.loading).remove(id);
                return Ok(doc);
            }
            let cache = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let outcome = cache.load(&id).await;
                cell.complete(outcome);
                lock(&cache.inner.loading).remove(&id);
            });
        }

        match waiter.wait().await {
            Ok(Ok(doc)) => Ok(doc),
            Ok(Err(reason)) => Err(ResolverError::Document {
                file: id.clone(),
                reason,
            }),
            Err(_) => Err(ResolverError::Document {
                file: id.clone(),
                reason: "load abandoned".to_string(),
            }),
        }
    }

    async fn load(&self, id: &FileId) -> LoadOutcome {
        let store = Arc::clone(&self.inner.store);
        let target = id.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let modified = store.modified(&target);
            store.open(&target).map(|doc| (doc, modified))
        })
        .await;
        match opened {
            Ok(Ok((doc, modified))) => {
                self.inner.loads.fetch_add(1, Ordering::Relaxed);
                let doc = Arc::new(doc);
                self.insert(id.clone(), Arc::clone(&doc), modified);
                debug!(file = %id, "document loaded");
                Ok(doc)
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn lookup(&self, id: &FileId) -> Option<Arc<ParsedDocument>> {
        let mut entries = lock(&self.inner.entries);
        let expired = match entries.get(id) {
            Some(entry) if entry.loaded_at.elapsed() <= self.inner.ttl => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.doc));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(id);
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn insert(&self, id: FileId, doc: Arc<ParsedDocument>, modified: Option<SystemTime>) {
        let mut entries = lock(&self.inner.entries);
        if entries.len() >= entries.cap().get() && !entries.contains(&id) {
            let expired: Vec<FileId> = entries
                .iter()
                .filter(|(_, entry)| entry.loaded_at.elapsed() > self.inner.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            let mut evicted = expired.len() as u64;
            if entries.len() >= entries.cap().get() {
                entries.pop_lru();
                evicted += 1;
            }
            self.inner.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        entries.put(
            id,
            CachedDocument {
                doc,
                loaded_at: Instant::now(),
                modified,
            },
        );
    }

    /// Drops the entry for `id` if its file changed since it was cached.
    /// Blocks on the store.
    pub fn invalidate_if_modified(&self, id: &FileId) -> bool {
        let cached = lock(&self.inner.entries).peek(id).map(|entry| entry.modified);
        let Some(cached) = cached else {
            return false;
        };
        let current = self.inner.store.modified(id);
        let changed = match (cached, current) {
            (Some(cached), Some(current)) => current > cached,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.invalidate(id);
        }
        changed
    }

    pub fn invalidate(&self, id: &FileId) {
        if lock(&self.inner.entries).pop(id).is_some() {
            debug!(file = %id, "document invalidated");
        }
    }

    /// Runs [`Self::invalidate_if_modified`] over every cached entry.
    pub async fn check_for_updates(&self) -> Result<usize> {
        let cache = self.clone();
        let changed = tokio::task::spawn_blocking(move || {
            cache
                .cached_ids()
                .into_iter()
                .filter(|id| cache.invalidate_if_modified(id))
                .count()
        })
        .await?;
        if changed > 0 {
            info!(changed, "evicted modified documents");
        }
        Ok(changed)
    }

    /// Preloads documents in the given order until the cache is full.
    pub async fn warm(&self, ids: &[FileId]) -> usize {
        let capacity = lock(&self.inner.entries).cap().get();
        let mut warmed = 0;
        for id in ids.iter().take(capacity) {
            match self.acquire(id).await {
                Ok(_) => warmed += 1,
                Err(err) => warn!(file = %id, "failed to warm document: {err}"),
            }
        }
        warmed
    }

    pub fn spawn_monitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cache.check_for_updates().await {
                            warn!("document monitor failed: {err}");
                        }
                    }
                }
            }
            debug!("document monitor stopped");
        })
    }

    pub fn contains(&self, id: &FileId) -> bool {
        lock(&self.inner.entries).contains(id)
    }

    pub fn cached_ids(&self) -> Vec<FileId> {
        lock(&self.inner.entries)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DocumentCacheStats {
        DocumentCacheStats {
            entries: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            loads: self.inner.loads.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use pretty_assertions::assert_eq;

    fn cache(store: &Arc<MemoryStore>, capacity: usize, ttl: Duration) -> ParsedDocumentCache {
        ParsedDocumentCache::new(Arc::clone(store) as Arc<dyn DocumentStore>, capacity, ttl)
    }

    fn id(name: &str) -> FileId {
        FileId::from(name)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_acquires_share_one_load() {
        let store = Arc::new(MemoryStore::new());
        store.put("a.xlsx", vec![vec!["x".to_string()]]);
        store.set_open_delay(Duration::from_millis(50));
        let cache = cache(&store, 4, Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.acquire(&id("a.xlsx")).await }));
        }
        for handle in handles {
            let doc = handle.await.expect("join").expect("acquire");
            assert_eq!(doc.cell(0, 0), Some("x"));
        }
        assert_eq!(store.open_count("a.xlsx"), 1);
        assert_eq!(cache.stats().loads, 1);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted_when_nothing_expired() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a.xlsx", "b.xlsx", "c.xlsx"] {
            store.put(name, Vec::new());
        }
        let cache = cache(&store, 2, Duration::from_secs(60));
        cache.acquire(&id("a.xlsx")).await.expect("a");
        cache.acquire(&id("b.xlsx")).await.expect("b");
        cache.acquire(&id("a.xlsx")).await.expect("a again");
        cache.acquire(&id("c.xlsx")).await.expect("c");

        assert!(cache.contains(&id("a.xlsx")));
        assert!(!cache.contains(&id("b.xlsx")));
        assert!(cache.contains(&id("c.xlsx")));
        assert_eq!(store.open_count("a.xlsx"), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_before_older_unexpired_ones() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a.xlsx", "b.xlsx", "c.xlsx"] {
            store.put(name, Vec::new());
        }
        let cache = cache(&store, 2, Duration::from_millis(300));

        cache.acquire(&id("a.xlsx")).await.expect("a");
        tokio::time::sleep(Duration::from_millis(200)).await;
        cache.acquire(&id("b.xlsx")).await.expect("b");
        // Hit: `a` becomes most recently used, `b` least recently used.
        cache.acquire(&id("a.xlsx")).await.expect("a hit");
        assert_eq!(store.open_count("a.xlsx"), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.acquire(&id("c.xlsx")).await.expect("c");

        assert!(!cache.contains(&id("a.xlsx")));
        assert!(cache.contains(&id("b.xlsx")));
        assert!(cache.contains(&id("c.xlsx")));
    }

    #[tokio::test]
    async fn modified_files_are_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store.put("a.xlsx", vec![vec!["old".to_string()]]);
        let cache = cache(&store, 4, Duration::from_secs(60));
        cache.acquire(&id("a.xlsx")).await.expect("a");

        assert_eq!(cache.check_for_updates().await.expect("check"), 0);
        store.put("a.xlsx", vec![vec!["new".to_string()]]);
        assert_eq!(cache.check_for_updates().await.expect("check"), 1);
        assert!(!cache.contains(&id("a.xlsx")));

        let doc = cache.acquire(&id("a.xlsx")).await.expect("reload");
        assert_eq!(doc.cell(0, 0), Some("new"));
    }

    #[tokio::test]
    async fn failed_loads_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache(&store, 4, Duration::from_secs(60));
        let err = cache.acquire(&id("missing.xlsx")).await.expect_err("missing");
        assert!(matches!(err, ResolverError::Document { .. }));
        assert!(cache.is_empty());
    }
}
