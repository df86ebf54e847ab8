use crate::tier::Tier;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use std::time::SystemTime;

/// Identifier of one schedule file inside its storage location.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One entry of a storage listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileListing {
    pub id: FileId,
    pub name: String,
    pub modified: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Default per-group timetable; applicable to every day.
    Base { group: String },
    /// Exceptions for an inclusive date range.
    Override { start: NaiveDate, end: NaiveDate },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleFile {
    pub id: FileId,
    pub name: String,
    pub kind: FileKind,
    pub modified: SystemTime,
}

impl ScheduleFile {
    pub fn is_override(&self) -> bool {
        matches!(self.kind, FileKind::Override { .. })
    }

    pub fn group(&self) -> Option<&str> {
        match &self.kind {
            FileKind::Base { group } => Some(group),
            FileKind::Override { .. } => None,
        }
    }

    /// BASE files cover every date; OVERRIDE files cover their inclusive range.
    pub fn covers(&self, date: NaiveDate) -> bool {
        match self.kind {
            FileKind::Base { .. } => true,
            FileKind::Override { start, end } => start <= date && date <= end,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub period: u32,
    pub subject: String,
    pub instructor: String,
    pub room: Option<String>,
    pub subgroup: Option<u32>,
    pub group: Option<String>,
    pub is_override: bool,
    pub is_cancelled: bool,
}

/// Activities of one entity on one day, keyed by period number.
pub type DaySchedule = BTreeMap<u32, ActivityRecord>;

/// Inserts `record` into `day`, keeping an OVERRIDE record over a BASE one for
/// the same period. Between records of the same kind the first one stays.
pub fn merge_record(day: &mut DaySchedule, record: ActivityRecord) {
    match day.get(&record.period) {
        Some(existing) if existing.is_override || !record.is_override => {}
        _ => {
            day.insert(record.period, record);
        }
    }
}

/// Coalescing and caching key: (entity, start, end).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub entity: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RequestKey {
    pub fn new(entity: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            entity: normalize_entity(entity),
            start,
            end,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}..{}",
            self.entity,
            self.start.format("%d.%m.%Y"),
            self.end.format("%d.%m.%Y")
        )
    }
}

/// Fully merged and formatted answer for one [`RequestKey`].
#[derive(Clone, Debug)]
pub struct ResolutionResult {
    pub key: RequestKey,
    pub days: BTreeMap<NaiveDate, DaySchedule>,
    pub text: String,
    pub computed_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tier: Tier,
    /// False when the producing tier ran out of budget before every task finished.
    pub complete: bool,
}

impl ResolutionResult {
    pub fn is_empty(&self) -> bool {
        self.days.values().all(BTreeMap::is_empty)
    }

    pub fn activity_count(&self) -> usize {
        self.days.values().map(BTreeMap::len).sum()
    }
}

/// Canonical form of an entity name: trimmed, single spaces, and no blanks
/// between initials ("Иванов  И. И." becomes "Иванов И.И.").
pub fn normalize_entity(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for word in name.split_whitespace() {
        if !out.is_empty() && !(out.ends_with('.') && is_initial(word)) {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

// "И." and "И.И." are initials; "Ив." is not.
fn is_initial(word: &str) -> bool {
    word.ends_with('.')
        && word.split_terminator('.').all(|part| {
            let mut chars = part.chars();
            matches!((chars.next(), chars.next()), (Some(letter), None) if letter.is_uppercase())
        })
}
