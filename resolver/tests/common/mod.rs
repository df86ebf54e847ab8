#![allow(dead_code, clippy::expect_used)]

use chrono::NaiveDate;
use rota_resolver::DaySchedule;
use rota_resolver::DocumentStore;
use rota_resolver::FileId;
use rota_resolver::FileListing;
use rota_resolver::LayoutParser;
use rota_resolver::ParsedDocument;
use rota_resolver::ResolverError;
use rota_resolver::Result;
use rota_resolver::ScheduleFile;
use rota_resolver::TabularLayout;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;

#[derive(Default)]
pub struct FakeStore {
    files: Mutex<BTreeMap<String, (Vec<Vec<String>>, SystemTime)>>,
    version: Mutex<u64>,
}

impl FakeStore {
    pub fn put(&self, name: &str, rows: Vec<Vec<String>>) {
        let mut version = self.version.lock().expect("lock");
        *version += 1;
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(*version);
        self.files
            .lock()
            .expect("lock")
            .insert(name.to_string(), (rows, modified));
    }
}

impl DocumentStore for FakeStore {
    fn list(&self) -> Result<Vec<FileListing>> {
        Ok(self
            .files
            .lock()
            .expect("lock")
            .iter()
            .map(|(name, (_, modified))| FileListing {
                id: FileId::new(name.clone()),
                name: name.clone(),
                modified: *modified,
            })
            .collect())
    }

    fn modified(&self, id: &FileId) -> Option<SystemTime> {
        self.files
            .lock()
            .expect("lock")
            .get(id.as_str())
            .map(|(_, modified)| *modified)
    }

    fn open(&self, id: &FileId) -> Result<ParsedDocument> {
        let files = self.files.lock().expect("lock");
        let (rows, _) = files.get(id.as_str()).ok_or_else(|| ResolverError::Document {
            file: id.clone(),
            reason: "missing".to_string(),
        })?;
        Ok(ParsedDocument::new(id.clone(), rows.clone()))
    }
}

/// Tabular layout that records every (file, date) it was asked about.
#[derive(Default)]
pub struct CountingParser {
    calls: Mutex<HashMap<(FileId, NaiveDate), usize>>,
    delay: Mutex<Duration>,
}

impl CountingParser {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(delay),
        }
    }

    pub fn total(&self) -> usize {
        self.calls.lock().expect("lock").values().sum()
    }

    pub fn max_per_pair(&self) -> usize {
        self.calls.lock().expect("lock").values().copied().max().unwrap_or(0)
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
        *self
            .calls
            .lock()
            .expect("lock")
            .entry((file.id.clone(), date))
            .or_default() += 1;
        let delay = *self.delay.lock().expect("lock");
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
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

/// Two BASE files that never mention "Иванов И.И." and one OVERRIDE file
/// for 02.05.2025 placing him at period 3 in room А201.
pub fn seed_scenario(store: &FakeStore) {
    store.put(
        "ИСпВ-24-1.xlsx",
        vec![
            row(&["day", "period", "subject", "instructor", "room", "subgroup", "note"]),
            row(&["Четверг", "1", "История", "Петров П.П.", "В301", "", ""]),
            row(&["Пятница", "3", "Физика", "Сидорова А.Б.", "В302", "", ""]),
        ],
    );
    store.put(
        "ИСпВ-24-2.xlsx",
        vec![
            row(&["day", "period", "subject", "instructor", "room", "subgroup", "note"]),
            row(&["Суббота", "2", "Химия", "Кузнецова Е.В.", "В303", "1", ""]),
        ],
    );
    store.put(
        "02.05.25.xlsx",
        vec![
            row(&["day", "period", "subject", "instructor", "room", "subgroup", "note"]),
            row(&["02.05.2025", "3", "Информатика", "Иванов И.И.", "А201", "", ""]),
        ],
    );
}
