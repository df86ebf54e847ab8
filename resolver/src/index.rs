use crate::catalog::FileCatalog;
use crate::config::IndexConfig;
use crate::doc_cache::ParsedDocumentCache;
use crate::error::ResolverError;
use crate::error::Result;
use crate::model::FileId;
use crate::model::FileKind;
use crate::model::FileListing;
use crate::model::ScheduleFile;
use crate::model::normalize_entity;
use crate::store::ParsedDocument;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream;
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Immutable result of one index build.
#[derive(Debug)]
pub struct IndexSnapshot {
    pub generation: u64,
    pub catalog: FileCatalog,
    pub listing: Vec<FileListing>,
    pub built_at: Instant,
    entities: HashMap<String, BTreeSet<FileId>>,
    dates: BTreeMap<NaiveDate, BTreeSet<FileId>>,
}

impl IndexSnapshot {
    /// Files whose scan window mentions a name containing `entity`, the same
    /// containment rule the layout applies to instructor cells.
    pub fn files_for_entity(&self, entity: &str) -> Vec<Arc<ScheduleFile>> {
        let entity = normalize_entity(entity);
        if entity.is_empty() {
            return Vec::new();
        }
        let ids: BTreeSet<&FileId> = self
            .entities
            .iter()
            .filter(|(name, _)| name.contains(&entity))
            .flat_map(|(_, ids)| ids)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.catalog.get(id))
            .cloned()
            .collect()
    }

    /// OVERRIDE files covering `date`.
    pub fn overrides_for_date(&self, date: NaiveDate) -> Vec<Arc<ScheduleFile>> {
        let Some(ids) = self.dates.get(&date) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.catalog.get(id))
            .cloned()
            .collect()
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.built_at.elapsed() > max_age
    }
}

/// Files added, removed or modified between two listings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListingDiff {
    pub added: Vec<FileId>,
    pub removed: Vec<FileId>,
    pub modified: Vec<FileId>,
}

impl ListingDiff {
    pub fn between(previous: &[FileListing], current: &[FileListing]) -> Self {
        let before: HashMap<&FileId, &FileListing> =
            previous.iter().map(|entry| (&entry.id, entry)).collect();
        let after: HashMap<&FileId, &FileListing> =
            current.iter().map(|entry| (&entry.id, entry)).collect();
        let mut diff = Self::default();
        for entry in current {
            match before.get(&entry.id) {
                None => diff.added.push(entry.id.clone()),
                Some(old) if old.modified != entry.modified => {
                    diff.modified.push(entry.id.clone());
                }
                Some(_) => {}
            }
        }
        for entry in previous {
            if !after.contains_key(&entry.id) {
                diff.removed.push(entry.id.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

#[derive(Clone, Debug)]
pub struct BuildReport {
    pub snapshot: Arc<IndexSnapshot>,
    /// Difference to the previous snapshot; everything counts as added on
    /// the first build.
    pub diff: ListingDiff,
    /// False when this call collapsed into a build that finished while it waited.
    pub rebuilt: bool,
}

/// Entity and date index over the catalog, rebuilt wholesale.
#[derive(Clone)]
pub struct EntityIndex {
    inner: Arc<Inner>,
}

struct Inner {
    docs: ParsedDocumentCache,
    pattern: Option<Regex>,
    scan_rows: usize,
    scan_cols: usize,
    concurrency: usize,
    snapshot: watch::Sender<Option<Arc<IndexSnapshot>>>,
    build_lock: Mutex<()>,
}

impl EntityIndex {
    pub fn new(docs: ParsedDocumentCache, config: &IndexConfig) -> Self {
        let pattern = match Regex::new(&config.entity_pattern) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!("invalid entity pattern, entity index disabled: {err}");
                None
            }
        };
        let (snapshot, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                docs,
                pattern,
                scan_rows: config.scan_rows,
                scan_cols: config.scan_cols,
                concurrency: config.build_concurrency.max(1),
                snapshot,
                build_lock: Mutex::new(()),
            }),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.inner.snapshot.borrow().clone()
    }

    /// Whether `entity` has the full shape of an indexed name. Partial names
    /// can match cells the pattern never captured.
    pub fn is_index_key(&self, entity: &str) -> bool {
        let entity = normalize_entity(entity);
        self.inner.pattern.as_ref().is_some_and(|pattern| {
            pattern
                .find(&entity)
                .is_some_and(|found| found.start() == 0 && found.end() == entity.len())
        })
    }

    pub fn is_ready(&self) -> bool {
        self.inner.snapshot.borrow().is_some()
    }

    /// Waits up to `limit` for a first build to land.
    pub async fn wait_ready(&self, limit: Duration) -> Result<Arc<IndexSnapshot>> {
        if let Some(snapshot) = self.snapshot() {
            return Ok(snapshot);
        }
        let mut rx = self.inner.snapshot.subscribe();
        match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(snapshot)) => (*snapshot).clone().ok_or(ResolverError::IndexNotReady),
            Ok(Err(_)) | Err(_) => Err(ResolverError::IndexNotReady),
        }
    }

    /// Fresh storage listing, read off the async runtime.
    pub async fn list_files(&self) -> Result<Vec<FileListing>> {
        let store = Arc::clone(self.inner.docs.store());
        tokio::task::spawn_blocking(move || store.list()).await?
    }

    /// Starts a rebuild on its own task unless one is already running.
    pub fn spawn_rebuild(&self) {
        if self.inner.build_lock.try_lock().is_err() {
            return;
        }
        let index = self.clone();
        tokio::spawn(async move {
            if let Err(err) = index.rebuild().await {
                warn!("background index build failed: {err}");
            }
        });
    }

    /// Rebuilds both maps from a fresh listing. Concurrent callers queue on
    /// one lock; a caller that finds a newer snapshot after waiting returns
    /// it instead of scanning again.
    pub async fn rebuild(&self) -> Result<BuildReport> {
        let observed = self.snapshot().map(|snapshot| snapshot.generation);
        let _guard = self.inner.build_lock.lock().await;
        let previous = self.snapshot();
        if let Some(current) = &previous
            && Some(current.generation) != observed
        {
            debug!(generation = current.generation, "index build collapsed");
            return Ok(BuildReport {
                snapshot: Arc::clone(current),
                diff: ListingDiff::default(),
                rebuilt: false,
            });
        }

        let started = Instant::now();
        let listing = self.list_files().await?;
        let diff = ListingDiff::between(
            previous
                .as_ref()
                .map(|snapshot| snapshot.listing.as_slice())
                .unwrap_or_default(),
            &listing,
        );
        for id in diff.modified.iter().chain(diff.removed.iter()) {
            self.inner.docs.invalidate(id);
        }

        let catalog = FileCatalog::classify(&listing);
        let entities = self.scan_entities(&catalog).await;
        let dates = date_map(&catalog);
        let snapshot = Arc::new(IndexSnapshot {
            generation: previous.map_or(1, |snapshot| snapshot.generation + 1),
            catalog,
            listing,
            built_at: Instant::now(),
            entities,
            dates,
        });
        info!(
            generation = snapshot.generation,
            base = snapshot.catalog.base_files().len(),
            overrides = snapshot.catalog.override_files().len(),
            entities = snapshot.entity_count(),
            changed = diff.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "entity index built"
        );
        self.inner.snapshot.send_replace(Some(Arc::clone(&snapshot)));
        Ok(BuildReport {
            snapshot,
            diff,
            rebuilt: true,
        })
    }

    async fn scan_entities(&self, catalog: &FileCatalog) -> HashMap<String, BTreeSet<FileId>> {
        let mut entities: HashMap<String, BTreeSet<FileId>> = HashMap::new();
        let Some(pattern) = self.inner.pattern.as_ref() else {
            return entities;
        };
        let docs = &self.inner.docs;
        let mut scans = stream::iter(catalog.files().cloned())
            .map(|file| async move {
                let outcome = docs.acquire(&file.id).await;
                (file, outcome)
            })
            .buffer_unordered(self.inner.concurrency);

        while let Some((file, outcome)) = scans.next().await {
            let doc = match outcome {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(file = %file.id, "skipping file during indexing: {err}");
                    continue;
                }
            };
            for name in self.entities_in(&doc, pattern) {
                entities.entry(name).or_default().insert(file.id.clone());
            }
        }
        entities
    }

    fn entities_in(&self, doc: &ParsedDocument, pattern: &Regex) -> BTreeSet<String> {
        doc.window(self.inner.scan_rows, self.inner.scan_cols)
            .flat_map(|cell| pattern.find_iter(cell))
            .map(|found| normalize_entity(found.as_str()))
            .collect()
    }
}

fn date_map(catalog: &FileCatalog) -> BTreeMap<NaiveDate, BTreeSet<FileId>> {
    let mut dates: BTreeMap<NaiveDate, BTreeSet<FileId>> = BTreeMap::new();
    for file in catalog.override_files() {
        let FileKind::Override { start, end } = file.kind else {
            continue;
        };
        for date in start.iter_days().take_while(|date| *date <= end) {
            dates.entry(date).or_default().insert(file.id.clone());
        }
    }
    dates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use crate::test_support::MemoryStore;
    use crate::test_support::date;
    use crate::test_support::row;
    use pretty_assertions::assert_eq;

    fn index_over(store: &Arc<MemoryStore>) -> EntityIndex {
        let docs = ParsedDocumentCache::new(
            Arc::clone(store) as Arc<dyn DocumentStore>,
            30,
            Duration::from_secs(60),
        );
        EntityIndex::new(docs, &IndexConfig::default())
    }

    fn seed(store: &MemoryStore) {
        store.put(
            "group-a.xlsx",
            vec![
                row(&["day", "period", "subject", "instructor"]),
                row(&["Пятница", "1", "Математика", "Иванов И. И."]),
                row(&["Пятница", "2", "Физика", "Петров П.П."]),
            ],
        );
        store.put(
            "group-b.xlsx",
            vec![row(&["Четверг", "1", "История", "Сидорова А.Б."])],
        );
        store.put(
            "02.05.25.xlsx",
            vec![row(&["02.05.2025", "3", "Информатика", "Иванов И.И.", "А201"])],
        );
        store.put("bogus.25.xlsx", Vec::new());
    }

    #[tokio::test]
    async fn builds_entity_and_date_maps() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let index = index_over(&store);
        let report = index.rebuild().await.expect("build");
        let snapshot = report.snapshot;

        let ids = |files: Vec<Arc<ScheduleFile>>| {
            files
                .iter()
                .map(|file| file.id.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            ids(snapshot.files_for_entity("Иванов  И.И.")),
            vec!["02.05.25.xlsx".to_string(), "group-a.xlsx".to_string()]
        );
        assert_eq!(
            ids(snapshot.overrides_for_date(date(2, 5, 2025))),
            vec!["02.05.25.xlsx".to_string()]
        );
        assert!(snapshot.overrides_for_date(date(3, 5, 2025)).is_empty());
        assert_eq!(snapshot.entity_count(), 3);
        assert_eq!(report.diff.added.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_rebuilds_collapse() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        store.set_open_delay(Duration::from_millis(30));
        let index = index_over(&store);

        let (first, second, third) =
            tokio::join!(index.rebuild(), index.rebuild(), index.rebuild());
        let reports = [
            first.expect("first"),
            second.expect("second"),
            third.expect("third"),
        ];
        assert_eq!(reports.iter().filter(|report| report.rebuilt).count(), 1);
        assert_eq!(store.open_count("group-a.xlsx"), 1);
        assert!(reports.iter().all(|report| report.snapshot.generation == 1));
    }

    #[tokio::test]
    async fn rebuild_reports_listing_changes() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let index = index_over(&store);
        index.rebuild().await.expect("first build");

        store.put("group-a.xlsx", vec![row(&["Пятница", "1", "Химия", "Новиков Н.Н."])]);
        store.remove("group-b.xlsx");
        let report = index.rebuild().await.expect("second build");

        assert_eq!(report.diff.modified, vec![FileId::from("group-a.xlsx")]);
        assert_eq!(report.diff.removed, vec![FileId::from("group-b.xlsx")]);
        assert!(report.diff.added.is_empty());
        assert_eq!(report.snapshot.generation, 2);
        assert_eq!(report.snapshot.files_for_entity("Новиков Н.Н.").len(), 1);
        assert!(report.snapshot.files_for_entity("Сидорова А.Б.").is_empty());
    }

    #[tokio::test]
    async fn lookup_uses_name_containment() {
        let store = Arc::new(MemoryStore::new());
        seed(&store);
        let index = index_over(&store);
        let snapshot = index.rebuild().await.expect("build").snapshot;

        assert_eq!(snapshot.files_for_entity("Иванов").len(), 2);
        assert_eq!(snapshot.files_for_entity("Сидоров").len(), 1);
        assert!(snapshot.files_for_entity("Новиков").is_empty());
        assert!(snapshot.files_for_entity("  ").is_empty());
    }

    #[test]
    fn only_full_names_are_index_keys() {
        let store = Arc::new(MemoryStore::new());
        let index = index_over(&store);
        assert!(index.is_index_key("Иванов И.И."));
        assert!(index.is_index_key("Иванов  И. И."));
        assert!(!index.is_index_key("Иванов"));
        assert!(!index.is_index_key("Иванов И.И. (зам.)"));
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_a_build() {
        let store = Arc::new(MemoryStore::new());
        let index = index_over(&store);
        let err = index
            .wait_ready(Duration::from_millis(20))
            .await
            .expect_err("not built");
        assert!(matches!(err, ResolverError::IndexNotReady));
    }
}
