use crate::config::EngineConfig;
use crate::coordinator::CoordinatorStats;
use crate::coordinator::RequestCoordinator;
use crate::coordinator::RequestOrigin;
use crate::doc_cache::DocumentCacheStats;
use crate::doc_cache::ParsedDocumentCache;
use crate::error::Result;
use crate::format::PlainFormatter;
use crate::format::ScheduleFormatter;
use crate::index::BuildReport;
use crate::index::EntityIndex;
use crate::layout::LayoutParser;
use crate::layout::TabularLayout;
use crate::model::ResolutionResult;
use crate::pipeline::ResolutionPipeline;
use crate::pool::FileProcessingPool;
use crate::pool::PoolStats;
use crate::popularity::PopularityTracker;
use crate::refresher::BackgroundRefresher;
use crate::result_cache::ResultCache;
use crate::store::DirectoryStore;
use crate::store::DocumentStore;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

pub const DEGRADED_MESSAGE: &str =
    "The schedule is temporarily unavailable. Please try again in a few minutes.";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub index_ready: bool,
    pub index_generation: u64,
    pub base_files: usize,
    pub override_files: usize,
    pub entities: usize,
    pub popular_entities: usize,
    pub tracked_entities: usize,
    pub cached_results: usize,
    pub documents: DocumentCacheStats,
    pub pool: PoolStats,
    pub coordinator: CoordinatorStats,
}

/// Process-wide context: every component built once and shared explicitly.
pub struct ScheduleEngine {
    config: EngineConfig,
    docs: ParsedDocumentCache,
    index: EntityIndex,
    pool: FileProcessingPool,
    coordinator: RequestCoordinator,
    refresher: BackgroundRefresher,
}

impl ScheduleEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        parser: Arc<dyn LayoutParser>,
        formatter: Arc<dyn ScheduleFormatter>,
    ) -> Result<Self> {
        config.validate()?;
        let docs = ParsedDocumentCache::new(
            Arc::clone(&store),
            config.cache.document_capacity,
            config.cache.document_ttl,
        );
        let index = EntityIndex::new(docs.clone(), &config.index);
        let pool = FileProcessingPool::new(
            config.pool.workers,
            config.pool.task_timeout,
            docs.clone(),
            parser,
        );
        let pipeline = ResolutionPipeline::new(
            config.tiers.clone(),
            pool.clone(),
            index.clone(),
            store,
            formatter,
            config.calendar.clone(),
            config.index.ready_wait,
        );
        let popularity = PopularityTracker::load(
            config.popularity.threshold,
            config.popularity.store_path.clone(),
        );
        let coordinator = RequestCoordinator::new(
            Arc::new(pipeline),
            Arc::new(ResultCache::new()),
            Arc::new(popularity),
            config.coordinator.clone(),
            config.cache.clone(),
        );
        let refresher =
            BackgroundRefresher::new(coordinator.clone(), index.clone(), config.refresh.clone());
        Ok(Self {
            config,
            docs,
            index,
            pool,
            coordinator,
            refresher,
        })
    }

    /// Engine over a directory of workbooks with the tabular layout and the
    /// plain-text formatter.
    pub fn for_directory(config: EngineConfig, dir: &Path) -> Result<Self> {
        Self::new(
            config,
            Arc::new(DirectoryStore::new(dir)),
            Arc::new(TabularLayout),
            Arc::new(PlainFormatter),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &EntityIndex {
        &self.index
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn refresher(&self) -> &BackgroundRefresher {
        &self.refresher
    }

    pub async fn resolve(
        &self,
        entity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Arc<ResolutionResult>> {
        self.coordinator
            .resolve(entity, start, end, RequestOrigin::Foreground)
            .await
    }

    /// Outermost boundary: always produces display text. Failures are logged
    /// with their cause and replaced by a degraded message.
    pub async fn answer(&self, entity: &str, start: NaiveDate, end: NaiveDate) -> String {
        match self.resolve(entity, start, end).await {
            Ok(result) => result.text.clone(),
            Err(err) => {
                error!(entity, %start, %end, "resolution failed: {err}");
                DEGRADED_MESSAGE.to_string()
            }
        }
    }

    /// Builds (or rebuilds) the index; a changed listing clears cached results.
    pub async fn build_index(&self) -> Result<BuildReport> {
        let report = self.index.rebuild().await?;
        if report.rebuilt && !report.diff.is_empty() {
            self.coordinator.cache().clear();
        }
        Ok(report)
    }

    /// Preloads the most recently modified documents, up to the cache capacity.
    pub async fn warm_documents(&self) -> Result<usize> {
        let mut listing = self.index.list_files().await?;
        listing.sort_by(|a, b| b.modified.cmp(&a.modified));
        let ids: Vec<_> = listing.into_iter().map(|entry| entry.id).collect();
        Ok(self.docs.warm(&ids).await)
    }

    pub fn start_background(&self) -> BackgroundHandle {
        let shutdown = CancellationToken::new();
        let tasks = vec![
            self.docs
                .spawn_monitor(self.config.cache.monitor_interval, shutdown.clone()),
            self.refresher.spawn(shutdown.clone()),
        ];
        info!(
            refresh_interval = ?self.config.refresh.interval,
            monitor_interval = ?self.config.cache.monitor_interval,
            "background tasks started"
        );
        BackgroundHandle { shutdown, tasks }
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.index.snapshot();
        let popularity = self.coordinator.popularity();
        EngineStats {
            index_ready: snapshot.is_some(),
            index_generation: snapshot.as_ref().map_or(0, |s| s.generation),
            base_files: snapshot
                .as_ref()
                .map_or(0, |s| s.catalog.base_files().len()),
            override_files: snapshot
                .as_ref()
                .map_or(0, |s| s.catalog.override_files().len()),
            entities: snapshot.as_ref().map_or(0, |s| s.entity_count()),
            popular_entities: popularity.promoted().len(),
            tracked_entities: popularity.tracked(),
            cached_results: self.coordinator.cache().len(),
            documents: self.docs.stats(),
            pool: self.pool.stats(),
            coordinator: self.coordinator.stats(),
        }
    }
}

/// Running background tasks; cancelled on [`BackgroundHandle::shutdown`] or drop.
pub struct BackgroundHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels and waits up to `limit` for every task to stop.
    pub async fn shutdown(mut self, limit: Duration) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(limit, task).await.is_err() {
                info!("background task did not stop within {limit:?}");
            }
        }
    }
}

impl Drop for BackgroundHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use crate::test_support::MemoryStore;
    use crate::test_support::date;
    use crate::test_support::row;
    use pretty_assertions::assert_eq;

    fn engine(store: &Arc<MemoryStore>) -> ScheduleEngine {
        ScheduleEngine::new(
            EngineConfig::default(),
            Arc::clone(store) as Arc<dyn DocumentStore>,
            Arc::new(TabularLayout),
            Arc::new(PlainFormatter),
        )
        .expect("engine")
    }

    #[tokio::test]
    async fn answer_degrades_on_errors() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let text = engine
            .answer("Иванов И.И.", date(3, 5, 2025), date(1, 5, 2025))
            .await;
        assert_eq!(text, DEGRADED_MESSAGE);
    }

    #[tokio::test]
    async fn stats_reflect_index_and_caches() {
        let store = Arc::new(MemoryStore::new());
        store.put(
            "group.xlsx",
            vec![row(&["Пятница", "1", "Математика", "Иванов И.И.", "А101"])],
        );
        store.put("02.05.25.xlsx", Vec::new());
        let engine = engine(&store);
        engine.build_index().await.expect("index");
        assert_eq!(engine.warm_documents().await.expect("warm"), 2);
        engine
            .resolve("Иванов И.И.", date(1, 5, 2025), date(3, 5, 2025))
            .await
            .expect("resolve");

        let stats = engine.stats();
        assert!(stats.index_ready);
        assert_eq!(stats.base_files, 1);
        assert_eq!(stats.override_files, 1);
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.cached_results, 1);
        assert_eq!(stats.tracked_entities, 1);
        assert_eq!(stats.documents.entries, 2);
    }

    #[tokio::test]
    async fn background_handle_cancels_on_drop() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&store);
        let handle = engine.start_background();
        let token = handle.token();
        drop(handle);
        assert!(token.is_cancelled());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.pool.workers = 0;
        let store = Arc::new(MemoryStore::new());
        let built = ScheduleEngine::new(
            config,
            store as Arc<dyn DocumentStore>,
            Arc::new(TabularLayout),
            Arc::new(PlainFormatter),
        );
        assert!(built.is_err());
    }
}
