use crate::config::RefreshConfig;
use crate::coordinator::RequestCoordinator;
use crate::coordinator::RequestOrigin;
use crate::error::Result;
use crate::index::EntityIndex;
use chrono::Days;
use chrono::Local;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub index_rebuilt: bool,
    pub files_changed: usize,
    pub results_cleared: bool,
    pub entities_refreshed: usize,
    pub entities_failed: usize,
}

/// Periodic index maintenance and pre-computation for popular entities.
#[derive(Clone)]
pub struct BackgroundRefresher {
    coordinator: RequestCoordinator,
    index: EntityIndex,
    config: RefreshConfig,
}

impl BackgroundRefresher {
    pub fn new(coordinator: RequestCoordinator, index: EntityIndex, config: RefreshConfig) -> Self {
        Self {
            coordinator,
            index,
            config,
        }
    }

    /// One refresh pass anchored at `today`.
    pub async fn run_once(&self, today: NaiveDate) -> Result<RefreshReport> {
        let started = Instant::now();
        let mut report = RefreshReport::default();

        if self.index_needs_rebuild().await? {
            let build = self.index.rebuild().await?;
            report.index_rebuilt = build.rebuilt;
            report.files_changed = build.diff.len();
            if !build.diff.is_empty() {
                self.coordinator.cache().clear();
                report.results_cleared = true;
                info!(changed = build.diff.len(), "schedule files changed; result cache cleared");
            }
        }
        let purged = self.coordinator.cache().purge_expired();
        if purged > 0 {
            debug!(purged, "purged expired results");
        }

        let mut entities = self.coordinator.popularity().promoted();
        if let Some(limit) = self.config.max_entities {
            entities.truncate(limit);
        }
        let end = today
            .checked_add_days(Days::new(u64::from(self.config.window_days)))
            .unwrap_or(today);
        let coordinator = &self.coordinator;
        let mut refreshes = stream::iter(entities)
            .map(|entity| async move {
                let outcome = coordinator
                    .resolve(&entity, today, end, RequestOrigin::Background)
                    .await;
                (entity, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1));
        while let Some((entity, outcome)) = refreshes.next().await {
            match outcome {
                Ok(_) => report.entities_refreshed += 1,
                Err(err) => {
                    report.entities_failed += 1;
                    warn!(entity = %entity, "background refresh failed: {err}");
                }
            }
        }

        info!(
            rebuilt = report.index_rebuilt,
            refreshed = report.entities_refreshed,
            failed = report.entities_failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "background refresh finished"
        );
        Ok(report)
    }

    async fn index_needs_rebuild(&self) -> Result<bool> {
        let Some(snapshot) = self.index.snapshot() else {
            return Ok(true);
        };
        if snapshot.is_stale(self.config.index_max_age) {
            return Ok(true);
        }
        let listing = self.index.list_files().await?;
        Ok(listing != snapshot.listing)
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let refresher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresher.config.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let today = Local::now().date_naive();
                        if let Err(err) = refresher.run_once(today).await {
                            warn!("background refresh failed: {err}");
                        }
                    }
                }
            }
            debug!("background refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::config::CalendarConfig;
    use crate::config::CoordinatorConfig;
    use crate::config::IndexConfig;
    use crate::doc_cache::ParsedDocumentCache;
    use crate::format::PlainFormatter;
    use crate::layout::LayoutParser;
    use crate::pipeline::ResolutionPipeline;
    use crate::pool::FileProcessingPool;
    use crate::popularity::PopularityTracker;
    use crate::result_cache::ResultCache;
    use crate::store::DocumentStore;
    use crate::test_support::CountingParser;
    use crate::test_support::MemoryStore;
    use crate::test_support::date;
    use crate::test_support::row;
    use crate::tier::TierPlan;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: RequestCoordinator,
        refresher: BackgroundRefresher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.put(
            "group.xlsx",
            vec![row(&["Пятница", "1", "Математика", "Иванов И.И.", "А101"])],
        );
        let store_dyn = Arc::clone(&store) as Arc<dyn DocumentStore>;
        let docs = ParsedDocumentCache::new(Arc::clone(&store_dyn), 10, Duration::from_secs(60));
        let index = EntityIndex::new(docs.clone(), &IndexConfig::default());
        let pool = FileProcessingPool::new(
            4,
            Duration::from_secs(5),
            docs,
            Arc::new(CountingParser::new()) as Arc<dyn LayoutParser>,
        );
        let pipeline = ResolutionPipeline::new(
            TierPlan::default_chain(),
            pool,
            index.clone(),
            store_dyn,
            Arc::new(PlainFormatter),
            CalendarConfig::default(),
            Duration::from_secs(1),
        );
        let coordinator = RequestCoordinator::new(
            Arc::new(pipeline),
            Arc::new(ResultCache::new()),
            Arc::new(PopularityTracker::in_memory(1)),
            CoordinatorConfig::default(),
            CacheConfig::default(),
        );
        let refresher = BackgroundRefresher::new(
            coordinator.clone(),
            index,
            RefreshConfig::default(),
        );
        Fixture {
            store,
            coordinator,
            refresher,
        }
    }

    #[tokio::test]
    async fn precomputes_the_window_for_popular_entities() {
        let fixture = fixture();
        fixture.coordinator.popularity().record_access("Иванов И.И.");

        let report = fixture
            .refresher
            .run_once(date(1, 5, 2025))
            .await
            .expect("refresh");
        assert!(report.index_rebuilt);
        assert_eq!(report.entities_refreshed, 1);

        let cached = fixture.coordinator.cache().get(&crate::model::RequestKey::new(
            "Иванов И.И.",
            date(1, 5, 2025),
            date(15, 5, 2025),
        ));
        let cached = cached.expect("window cached");
        assert_eq!(cached.activity_count(), 2);
    }

    #[tokio::test]
    async fn unchanged_listing_keeps_the_index_and_cache() {
        let fixture = fixture();
        fixture.coordinator.popularity().record_access("Иванов И.И.");
        fixture.refresher.run_once(date(1, 5, 2025)).await.expect("first");

        let report = fixture
            .refresher
            .run_once(date(1, 5, 2025))
            .await
            .expect("second");
        assert!(!report.index_rebuilt);
        assert!(!report.results_cleared);
        assert_eq!(fixture.coordinator.cache().len(), 1);
    }

    #[tokio::test]
    async fn changed_files_clear_the_result_cache() {
        let fixture = fixture();
        fixture.refresher.run_once(date(1, 5, 2025)).await.expect("first");
        fixture
            .coordinator
            .resolve("Петров П.П.", date(1, 5, 2025), date(2, 5, 2025), RequestOrigin::Foreground)
            .await
            .expect("resolve");
        let before = fixture.coordinator.cache().len();
        assert!(before >= 1);

        fixture.store.put(
            "05.05.25.xlsx",
            vec![row(&["05.05.2025", "2", "Химия", "Петров П.П.", "Б201"])],
        );
        let report = fixture
            .refresher
            .run_once(date(1, 5, 2025))
            .await
            .expect("second");
        assert!(report.index_rebuilt);
        assert!(report.results_cleared);
        assert_eq!(report.files_changed, 1);
    }
}
