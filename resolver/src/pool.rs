use crate::doc_cache::ParsedDocumentCache;
use crate::doc_cache::lock;
use crate::layout::LayoutParser;
use crate::model::DaySchedule;
use crate::model::FileId;
use crate::model::ScheduleFile;
use crate::model::normalize_entity;
use crate::slot::OutcomeCell;
use crate::slot::WaitError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SubTaskKey {
    file: FileId,
    date: NaiveDate,
    entity: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SubTaskFailure {
    Failed(String),
    TimedOut,
}

type SubTaskOutcome = std::result::Result<DaySchedule, SubTaskFailure>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    /// Document or parse error; the pair contributes nothing.
    Failed,
    /// The worker or the caller gave up waiting.
    TimedOut,
}

/// Outcome for one (file, day) pair. Records are empty unless `Completed`.
#[derive(Clone, Debug)]
pub struct FileDayResult {
    pub file: Arc<ScheduleFile>,
    pub date: NaiveDate,
    pub records: DaySchedule,
    pub status: TaskStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub available: usize,
    pub in_flight: usize,
    pub started: u64,
    pub joined: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Runs the layout parser on a fixed number of blocking workers.
///
/// Identical (file, date, entity) sub-tasks submitted while one is running
/// share that run.
#[derive(Clone)]
pub struct FileProcessingPool {
    inner: Arc<Inner>,
}

struct Inner {
    workers: usize,
    permits: Arc<Semaphore>,
    docs: ParsedDocumentCache,
    parser: Arc<dyn LayoutParser>,
    task_timeout: Duration,
    in_flight: Mutex<HashMap<SubTaskKey, Arc<OutcomeCell<SubTaskOutcome>>>>,
    started: AtomicU64,
    joined: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl FileProcessingPool {
    pub fn new(
        workers: usize,
        task_timeout: Duration,
        docs: ParsedDocumentCache,
        parser: Arc<dyn LayoutParser>,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(Inner {
                workers,
                permits: Arc::new(Semaphore::new(workers)),
                docs,
                parser,
                task_timeout,
                in_flight: Mutex::new(HashMap::new()),
                started: AtomicU64::new(0),
                joined: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
            }),
        }
    }

    /// Resolves one (file, day) pair, waiting at most `wait`. Never fails:
    /// errors and timeouts come back as an empty, non-`Completed` result.
    pub async fn process(
        &self,
        file: Arc<ScheduleFile>,
        date: NaiveDate,
        entity: &str,
        wait: Duration,
    ) -> FileDayResult {
        let key = SubTaskKey {
            file: file.id.clone(),
            date,
            entity: normalize_entity(entity),
        };
        let (cell, owner) = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(cell) => (Arc::clone(cell), false),
                None => {
                    let cell = Arc::new(OutcomeCell::new());
                    in_flight.insert(key.clone(), Arc::clone(&cell));
                    (cell, true)
                }
            }
        };
        let waiter = cell.waiter();
        if owner {
            self.inner.started.fetch_add(1, Ordering::Relaxed);
            self.spawn_worker(key, Arc::clone(&file), cell);
        } else {
            self.inner.joined.fetch_add(1, Ordering::Relaxed);
        }

        let (records, status) = match waiter.wait_timeout(wait).await {
            Ok(Ok(records)) => (records, TaskStatus::Completed),
            Ok(Err(SubTaskFailure::Failed(_))) | Err(WaitError::Abandoned) => {
                (DaySchedule::new(), TaskStatus::Failed)
            }
            Ok(Err(SubTaskFailure::TimedOut)) | Err(WaitError::TimedOut) => {
                (DaySchedule::new(), TaskStatus::TimedOut)
            }
        };
        FileDayResult {
            file,
            date,
            records,
            status,
        }
    }

    fn spawn_worker(
        &self,
        key: SubTaskKey,
        file: Arc<ScheduleFile>,
        cell: Arc<OutcomeCell<SubTaskOutcome>>,
    ) {
        let pool = self.clone();
        tokio::spawn(async move {
            let timeout = pool.inner.task_timeout;
            // The worker timeout starts once a worker is free; queueing for a
            // permit is bounded by the caller's own wait.
            let outcome = match Arc::clone(&pool.inner.permits).acquire_owned().await {
                Ok(permit) => {
                    match tokio::time::timeout(timeout, pool.run(&key, file, permit)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(SubTaskFailure::TimedOut),
                    }
                }
                Err(err) => Err(SubTaskFailure::Failed(err.to_string())),
            };
            match &outcome {
                Ok(_) => {}
                Err(SubTaskFailure::Failed(reason)) => {
                    pool.inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(file = %key.file, date = %key.date, "sub-task failed: {reason}");
                }
                Err(SubTaskFailure::TimedOut) => {
                    pool.inner.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(file = %key.file, date = %key.date, ?timeout, "sub-task timed out");
                }
            }
            cell.complete(outcome);
            let mut in_flight = lock(&pool.inner.in_flight);
            if in_flight
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &cell))
            {
                in_flight.remove(&key);
            }
        });
    }

    async fn run(
        &self,
        key: &SubTaskKey,
        file: Arc<ScheduleFile>,
        permit: OwnedSemaphorePermit,
    ) -> SubTaskOutcome {
        let doc = self
            .inner
            .docs
            .acquire(&key.file)
            .await
            .map_err(|err| SubTaskFailure::Failed(err.to_string()))?;

        let parser = Arc::clone(&self.inner.parser);
        let date = key.date;
        let entity = key.entity.clone();
        // The permit moves into the blocking closure so a worker that outlives
        // its timeout still counts against the pool.
        let parsed = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            parser
                .parse(&doc, &file, date, &entity)
                .map(|records| stamp(records, &file))
        })
        .await
        .map_err(|err| SubTaskFailure::Failed(err.to_string()))?;

        let records = parsed.map_err(|err| SubTaskFailure::Failed(err.to_string()))?;
        debug!(file = %key.file, date = %key.date, records = records.len(), "sub-task done");
        Ok(records)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.inner.workers,
            available: self.inner.permits.available_permits(),
            in_flight: lock(&self.inner.in_flight).len(),
            started: self.inner.started.load(Ordering::Relaxed),
            joined: self.inner.joined.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Applies the file's kind to every record it produced.
fn stamp(mut records: DaySchedule, file: &ScheduleFile) -> DaySchedule {
    for record in records.values_mut() {
        record.is_override = file.is_override();
        if record.group.is_none() {
            record.group = file.group().map(str::to_string);
        }
    }
    records
}
