use crate::doc_cache::lock;
use crate::error::ResolverError;
use crate::error::Result;
use crate::layout::LayoutParser;
use crate::layout::TabularLayout;
use crate::model::DaySchedule;
use crate::model::FileId;
use crate::model::FileListing;
use crate::model::ScheduleFile;
use crate::store::DocumentStore;
use crate::store::ParsedDocument;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

struct StoredFile {
    rows: Vec<Vec<String>>,
    modified: SystemTime,
}

/// In-memory storage location; every `put` bumps the modification time.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, StoredFile>>,
    opens: Mutex<HashMap<String, usize>>,
    open_delay: Mutex<Duration>,
    failing_lists: Mutex<(usize, Duration)>,
    version: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, rows: Vec<Vec<String>>) {
        let version = {
            let mut version = lock(&self.version);
            *version += 1;
            *version
        };
        lock(&self.files).insert(
            name.to_string(),
            StoredFile {
                rows,
                modified: SystemTime::UNIX_EPOCH + Duration::from_secs(version),
            },
        );
    }

    pub fn remove(&self, name: &str) {
        lock(&self.files).remove(name);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.open_delay) = delay;
    }

    /// The next `count` listings wait `delay` and then fail.
    pub fn fail_lists(&self, count: usize, delay: Duration) {
        *lock(&self.failing_lists) = (count, delay);
    }

    pub fn open_count(&self, name: &str) -> usize {
        lock(&self.opens).get(name).copied().unwrap_or_default()
    }
}

impl DocumentStore for MemoryStore {
    fn list(&self) -> Result<Vec<FileListing>> {
        let failure = {
            let mut failing = lock(&self.failing_lists);
            if failing.0 > 0 {
                failing.0 -= 1;
                Some(failing.1)
            } else {
                None
            }
        };
        if let Some(delay) = failure {
            std::thread::sleep(delay);
            return Err(ResolverError::Listing("storage offline".to_string()));
        }
        Ok(lock(&self.files)
            .iter()
            .map(|(name, file)| FileListing {
                id: FileId::new(name.clone()),
                name: name.clone(),
                modified: file.modified,
            })
            .collect())
    }

    fn modified(&self, id: &FileId) -> Option<SystemTime> {
        lock(&self.files).get(id.as_str()).map(|file| file.modified)
    }

    fn open(&self, id: &FileId) -> Result<ParsedDocument> {
        *lock(&self.opens).entry(id.to_string()).or_default() += 1;
        let delay = *lock(&self.open_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let rows = lock(&self.files)
            .get(id.as_str())
            .map(|file| file.rows.clone())
            .ok_or_else(|| ResolverError::Document {
                file: id.clone(),
                reason: "no such file".to_string(),
            })?;
        Ok(ParsedDocument::new(id.clone(), rows))
    }
}

/// [`TabularLayout`] that counts calls per (file, date) and can be slowed down.
#[derive(Default)]
pub struct CountingParser {
    calls: Mutex<HashMap<(FileId, NaiveDate), usize>>,
    delay: Mutex<Duration>,
}

impl CountingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    pub fn max_calls_per_pair(&self) -> usize {
        lock(&self.calls).values().copied().max().unwrap_or_default()
    }
}

impl LayoutParser for CountingParser {
    fn parse(
        &self,
        doc: &ParsedDocument,
        file: &ScheduleFile,
        date: NaiveDate,
        entity: &str,
    ) -> Result<DaySchedule> {
        *lock(&self.calls).entry((file.id.clone(), date)).or_default() += 1;
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        TabularLayout.parse(doc, file, date, entity)
    }
}

pub fn row(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|cell| (*cell).to_string()).collect()
}

pub fn date(day: u32, month: u32, year: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}
