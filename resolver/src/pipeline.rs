use crate::catalog::FileCatalog;
use crate::config::CalendarConfig;
use crate::error::ResolverError;
use crate::error::Result;
use crate::format::ScheduleFormatter;
use crate::index::EntityIndex;
use crate::model::DaySchedule;
use crate::model::RequestKey;
use crate::model::ScheduleFile;
use crate::model::merge_record;
use crate::pool::FileDayResult;
use crate::pool::FileProcessingPool;
use crate::pool::TaskStatus;
use crate::range::plan_days;
use crate::store::DocumentStore;
use crate::tier::Tier;
use crate::tier::TierPlan;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Merged answer of one tier run, before caching.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub days: BTreeMap<NaiveDate, DaySchedule>,
    pub text: String,
    pub tier: Tier,
    pub complete: bool,
}

impl Resolved {
    pub fn activity_count(&self) -> usize {
        self.days.values().map(BTreeMap::len).sum()
    }
}

struct Dispatch {
    /// Position in the task list; keeps merge order independent of completion order.
    order: usize,
    file: Arc<ScheduleFile>,
    date: NaiveDate,
}

struct TierRun {
    days: BTreeMap<NaiveDate, DaySchedule>,
    complete: bool,
}

/// Ordered fallback chain over the processing pool.
pub struct ResolutionPipeline {
    tiers: Vec<TierPlan>,
    pool: FileProcessingPool,
    index: EntityIndex,
    store: Arc<dyn DocumentStore>,
    formatter: Arc<dyn ScheduleFormatter>,
    calendar: CalendarConfig,
    index_wait: Duration,
}

impl ResolutionPipeline {
    pub fn new(
        tiers: Vec<TierPlan>,
        pool: FileProcessingPool,
        index: EntityIndex,
        store: Arc<dyn DocumentStore>,
        formatter: Arc<dyn ScheduleFormatter>,
        calendar: CalendarConfig,
        index_wait: Duration,
    ) -> Self {
        Self {
            tiers,
            pool,
            index,
            store,
            formatter,
            calendar,
            index_wait,
        }
    }

    pub fn tiers(&self) -> &[TierPlan] {
        &self.tiers
    }

    /// Walks the configured tiers until one completes within its budget.
    pub async fn resolve(&self, key: &RequestKey) -> Result<Resolved> {
        self.resolve_with(key, &self.tiers).await
    }

    /// Unindexed tiers only; used when a joined computation failed.
    pub async fn resolve_direct(&self, key: &RequestKey) -> Result<Resolved> {
        let mut plans: Vec<TierPlan> = self
            .tiers
            .iter()
            .filter(|plan| plan.tier != Tier::Indexed)
            .cloned()
            .collect();
        if plans.is_empty() {
            plans = vec![TierPlan::optimized(), TierPlan::simple()];
        }
        self.resolve_with(key, &plans).await
    }

    async fn resolve_with(&self, key: &RequestKey, plans: &[TierPlan]) -> Result<Resolved> {
        let mut best: Option<Resolved> = None;
        let mut last_error: Option<ResolverError> = None;

        for plan in plans {
            let started = Instant::now();
            match self.run_tier(plan, key).await {
                Ok(run) => {
                    let resolved = self.finish(key, plan.tier, run);
                    if resolved.complete {
                        info!(
                            entity = %key.entity,
                            tier = %plan.tier,
                            activities = resolved.activity_count(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "resolved"
                        );
                        return Ok(resolved);
                    }
                    let budget = plan.overall_budget.unwrap_or(plan.file_timeout);
                    warn!(
                        entity = %key.entity,
                        activities = resolved.activity_count(),
                        "{}; falling back",
                        ResolverError::TierTimeout {
                            tier: plan.tier,
                            budget,
                        }
                    );
                    if best
                        .as_ref()
                        .is_none_or(|kept| resolved.activity_count() > kept.activity_count())
                    {
                        best = Some(resolved);
                    }
                }
                Err(err) => {
                    warn!(entity = %key.entity, tier = %plan.tier, "tier failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        match (best, last_error) {
            (Some(partial), _) => Ok(partial),
            (None, Some(err)) => Err(ResolverError::Exhausted(err.to_string())),
            (None, None) => Err(ResolverError::Exhausted("no tiers configured".to_string())),
        }
    }

    fn finish(&self, key: &RequestKey, tier: Tier, run: TierRun) -> Resolved {
        let text = self
            .formatter
            .format(&run.days, &key.entity, key.start, key.end);
        Resolved {
            days: run.days,
            text,
            tier,
            complete: run.complete,
        }
    }

    async fn run_tier(&self, plan: &TierPlan, key: &RequestKey) -> Result<TierRun> {
        let (days, tasks) = match plan.tier {
            Tier::Indexed => {
                let snapshot = match self.index.wait_ready(self.index_wait).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        self.index.spawn_rebuild();
                        return Err(err);
                    }
                };
                let listing = self.index.list_files().await?;
                if listing != snapshot.listing {
                    self.index.spawn_rebuild();
                    return Err(ResolverError::IndexStale);
                }
                let candidates = snapshot.files_for_entity(&key.entity);
                if candidates.is_empty() || !self.index.is_index_key(&key.entity) {
                    return Err(ResolverError::IndexMiss {
                        entity: key.entity.clone(),
                    });
                }
                let days = self.days(key, &snapshot.catalog);
                let base: Vec<Arc<ScheduleFile>> = candidates
                    .into_iter()
                    .filter(|file| !file.is_override())
                    .collect();
                let mut tasks = Vec::new();
                for &date in &days {
                    for file in base.iter().cloned().chain(snapshot.overrides_for_date(date)) {
                        tasks.push((file, date));
                    }
                }
                (days, tasks)
            }
            Tier::Optimized | Tier::Simple => {
                let store = Arc::clone(&self.store);
                let listing = tokio::task::spawn_blocking(move || store.list()).await??;
                let catalog = FileCatalog::classify(&listing);
                let days = self.days(key, &catalog);
                let mut tasks = Vec::new();
                for &date in &days {
                    if plan.tier == Tier::Optimized {
                        for file in catalog.base_files() {
                            tasks.push((Arc::clone(file), date));
                        }
                    }
                    for file in catalog.overrides_for(date) {
                        tasks.push((file, date));
                    }
                }
                (days, tasks)
            }
        };
        debug!(entity = %key.entity, tier = %plan.tier, tasks = tasks.len(), "dispatching");

        let dispatch: Vec<Dispatch> = tasks
            .into_iter()
            .enumerate()
            .map(|(order, (file, date))| Dispatch { order, file, date })
            .collect();
        let (mut results, complete) = self.gather(plan, key, dispatch).await;

        results.sort_by_key(|(order, _)| *order);
        let mut merged: BTreeMap<NaiveDate, DaySchedule> = days
            .into_iter()
            .map(|date| (date, DaySchedule::new()))
            .collect();
        for (_, result) in results {
            let day = merged.entry(result.date).or_default();
            for record in result.records.into_values() {
                merge_record(day, record);
            }
        }
        Ok(TierRun {
            days: merged,
            complete,
        })
    }

    fn days(&self, key: &RequestKey, catalog: &FileCatalog) -> Vec<NaiveDate> {
        plan_days(
            key.start,
            key.end,
            self.calendar.rest_day,
            self.calendar.range_policy,
            catalog,
        )
    }

    /// Runs the dispatch list in batches under the tier's budgets. Returns the
    /// results that arrived in time and whether every task finished; a batch
    /// that misses its deadline ends the run.
    async fn gather(
        &self,
        plan: &TierPlan,
        key: &RequestKey,
        dispatch: Vec<Dispatch>,
    ) -> (Vec<(usize, FileDayResult)>, bool) {
        let overall_deadline = plan.overall_budget.map(|budget| Instant::now() + budget);
        let batch_size = plan.batch_size.unwrap_or(dispatch.len()).max(1);
        let total = dispatch.len();
        let mut results = Vec::with_capacity(total);
        let mut complete = true;

        let mut pending = dispatch.into_iter().peekable();
        'batches: while pending.peek().is_some() {
            let now = Instant::now();
            if overall_deadline.is_some_and(|deadline| deadline <= now) {
                complete = false;
                break;
            }
            let batch_deadline = match (plan.batch_timeout, overall_deadline) {
                (Some(limit), Some(deadline)) => Some((now + limit).min(deadline)),
                (Some(limit), None) => Some(now + limit),
                (None, deadline) => deadline,
            };
            let wait = batch_deadline.map_or(plan.file_timeout, |deadline| {
                plan.file_timeout.min(deadline.saturating_duration_since(now))
            });

            let mut running: FuturesUnordered<_> = pending
                .by_ref()
                .take(batch_size)
                .map(|task| {
                    let pool = self.pool.clone();
                    let entity = key.entity.as_str();
                    async move {
                        let result = pool.process(task.file, task.date, entity, wait).await;
                        (task.order, result)
                    }
                })
                .collect();

            loop {
                let next = match batch_deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, running.next()).await
                    {
                        Ok(next) => next,
                        Err(_) => {
                            complete = false;
                            break 'batches;
                        }
                    },
                    None => running.next().await,
                };
                let Some((order, result)) = next else {
                    break;
                };
                if result.status == TaskStatus::TimedOut {
                    complete = false;
                }
                results.push((order, result));
            }
            if !complete {
                break;
            }
        }
        if !complete {
            debug!(
                entity = %key.entity,
                tier = %plan.tier,
                finished = results.len(),
                total,
                "tier budget exhausted"
            );
        }
        (results, complete)
    }
}
