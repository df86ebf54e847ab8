use crate::config::CacheConfig;
use crate::config::CoordinatorConfig;
use crate::doc_cache::lock;
use crate::error::ResolverError;
use crate::error::Result;
use crate::model::RequestKey;
use crate::model::ResolutionResult;
use crate::pipeline::ResolutionPipeline;
use crate::pipeline::Resolved;
use crate::popularity::PopularityTracker;
use crate::result_cache::ResultCache;
use crate::slot::OutcomeCell;
use crate::slot::WaitError;
use chrono::NaiveDate;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Who asked. Background refreshes skip the cache read and the access count
/// but still coalesce with foreground requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOrigin {
    Foreground,
    Background,
}

type SlotOutcome = std::result::Result<Arc<ResolutionResult>, String>;

/// Shared in-flight computation for one key.
struct CoalescingSlot {
    cell: OutcomeCell<SlotOutcome>,
    created_at: Instant,
}

enum Role {
    Owner(Arc<CoalescingSlot>),
    Joiner(Arc<CoalescingSlot>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub cache_hits: u64,
    pub computations: u64,
    pub joins: u64,
    pub detached: u64,
    pub degraded: u64,
    pub active_slots: usize,
}

/// Cache check plus join-or-own over the coalescing slot table.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Arc<ResolutionPipeline>,
    cache: Arc<ResultCache>,
    popularity: Arc<PopularityTracker>,
    config: CoordinatorConfig,
    ttls: CacheConfig,
    slots: Mutex<HashMap<RequestKey, Arc<CoalescingSlot>>>,
    cache_hits: AtomicU64,
    computations: AtomicU64,
    joins: AtomicU64,
    detached: AtomicU64,
    degraded: AtomicU64,
}

impl RequestCoordinator {
    pub fn new(
        pipeline: Arc<ResolutionPipeline>,
        cache: Arc<ResultCache>,
        popularity: Arc<PopularityTracker>,
        config: CoordinatorConfig,
        ttls: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                cache,
                popularity,
                config,
                ttls,
                slots: Mutex::new(HashMap::new()),
                cache_hits: AtomicU64::new(0),
                computations: AtomicU64::new(0),
                joins: AtomicU64::new(0),
                detached: AtomicU64::new(0),
                degraded: AtomicU64::new(0),
            }),
        }
    }

    pub async fn resolve(
        &self,
        entity: &str,
        start: NaiveDate,
        end: NaiveDate,
        origin: RequestOrigin,
    ) -> Result<Arc<ResolutionResult>> {
        if start > end {
            return Err(ResolverError::InvalidRange { start, end });
        }
        let key = RequestKey::new(entity, start, end);
        if key.entity.is_empty() {
            return Err(ResolverError::Config("entity name is empty".to_string()));
        }

        if origin == RequestOrigin::Foreground {
            self.inner.popularity.record_access(&key.entity);
            if let Some(hit) = self.inner.cache.get(&key) {
                self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "result cache hit");
                return Ok(hit);
            }
        }

        match self.claim(&key) {
            Role::Owner(slot) => self.own(key, slot).await,
            Role::Joiner(slot) => self.join(key, slot).await,
        }
    }

    fn claim(&self, key: &RequestKey) -> Role {
        let mut slots = lock(&self.inner.slots);
        if let Some(slot) = slots.get(key) {
            if slot.created_at.elapsed() < self.inner.config.hang_threshold {
                return Role::Joiner(Arc::clone(slot));
            }
            warn!(key = %key, "replacing coalescing slot past the hang threshold");
        }
        let slot = Arc::new(CoalescingSlot {
            cell: OutcomeCell::new(),
            created_at: Instant::now(),
        });
        slots.insert(key.clone(), Arc::clone(&slot));
        Role::Owner(slot)
    }

    /// Runs the pipeline on its own task so joiners still get an outcome if
    /// the owning caller goes away.
    async fn own(
        &self,
        key: RequestKey,
        slot: Arc<CoalescingSlot>,
    ) -> Result<Arc<ResolutionResult>> {
        self.inner.computations.fetch_add(1, Ordering::Relaxed);
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let mut guard = SlotGuard {
                coordinator: &coordinator,
                key: &key,
                slot: &slot,
                armed: true,
            };
            let outcome = coordinator.inner.pipeline.resolve(&key).await;
            let outcome = outcome.map(|resolved| coordinator.store(&key, resolved));
            guard.armed = false;
            match &outcome {
                Ok(result) => {
                    slot.cell.complete(Ok(Arc::clone(result)));
                    coordinator.release_later(key.clone(), Arc::clone(&slot));
                }
                Err(err) => {
                    error!(key = %key, "resolution failed: {err}");
                    slot.cell.complete(Err(err.to_string()));
                    coordinator.release(&key, &slot);
                }
            }
            outcome
        });
        handle.await?
    }

    async fn join(
        &self,
        key: RequestKey,
        slot: Arc<CoalescingSlot>,
    ) -> Result<Arc<ResolutionResult>> {
        self.inner.joins.fetch_add(1, Ordering::Relaxed);
        let waiter = slot.cell.waiter();
        drop(slot);
        let limit = self.inner.config.join_timeout;
        match waiter.wait_timeout(limit).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(reason)) => {
                self.inner.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "joined computation failed ({reason}); scanning directly");
                let resolved = self.inner.pipeline.resolve_direct(&key).await?;
                Ok(self.store(&key, resolved))
            }
            Err(WaitError::TimedOut) => {
                warn!(
                    key = %key,
                    "{}; computing independently",
                    ResolverError::CoordinatorJoinTimeout(limit)
                );
                self.detached(&key).await
            }
            Err(WaitError::Abandoned) => {
                warn!(key = %key, "joined computation vanished; computing independently");
                self.detached(&key).await
            }
        }
    }

    async fn detached(&self, key: &RequestKey) -> Result<Arc<ResolutionResult>> {
        self.inner.detached.fetch_add(1, Ordering::Relaxed);
        let resolved = self.inner.pipeline.resolve(key).await?;
        Ok(self.store(key, resolved))
    }

    /// Wraps a pipeline answer with its TTL and writes it to the result cache.
    fn store(&self, key: &RequestKey, resolved: Resolved) -> Arc<ResolutionResult> {
        let ttls = &self.inner.ttls;
        let ttl = if !resolved.complete {
            ttls.partial_result_ttl
        } else if self.inner.popularity.is_popular(&key.entity) {
            ttls.popular_result_ttl
        } else {
            ttls.result_ttl
        };
        let result = Arc::new(ResolutionResult {
            key: key.clone(),
            days: resolved.days,
            text: resolved.text,
            computed_at: Utc::now(),
            ttl,
            tier: resolved.tier,
            complete: resolved.complete,
        });
        self.inner.cache.insert(Arc::clone(&result));
        result
    }

    fn release(&self, key: &RequestKey, slot: &Arc<CoalescingSlot>) {
        let mut slots = lock(&self.inner.slots);
        if slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(key);
        }
    }

    /// Keeps a finished slot visible for the grace window so callers that
    /// just missed the cache write still join it.
    fn release_later(&self, key: RequestKey, slot: Arc<CoalescingSlot>) {
        let grace = self.inner.config.release_grace;
        if grace.is_zero() {
            self.release(&key, &slot);
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            coordinator.release(&key, &slot);
        });
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.inner.cache
    }

    pub fn popularity(&self) -> &Arc<PopularityTracker> {
        &self.inner.popularity
    }

    pub fn pipeline(&self) -> &Arc<ResolutionPipeline> {
        &self.inner.pipeline
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            computations: self.inner.computations.load(Ordering::Relaxed),
            joins: self.inner.joins.load(Ordering::Relaxed),
            detached: self.inner.detached.load(Ordering::Relaxed),
            degraded: self.inner.degraded.load(Ordering::Relaxed),
            active_slots: lock(&self.inner.slots).len(),
        }
    }
}

/// Removes the slot if the owning task unwinds before completing it, so
/// joiners see the cell abandoned instead of waiting out their timeout.
struct SlotGuard<'a> {
    coordinator: &'a RequestCoordinator,
    key: &'a RequestKey,
    slot: &'a Arc<CoalescingSlot>,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed && !self.slot.cell.is_complete() {
            info!(key = %self.key, "owner dropped without an outcome; releasing slot");
            self.coordinator.release(self.key, self.slot);
        }
    }
}
