use crate::model::FileId;
use crate::model::FileKind;
use crate::model::FileListing;
use crate::model::ScheduleFile;
use chrono::NaiveDate;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::warn;

static OVERRIDE_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d{2}\.\d{2}\.\d{2,4})(?:-(\d{2}\.\d{2}\.\d{2,4}))?\.xlsx$").ok()
});

static DATE_LIKE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d{2}\.\d{2}\.\d+").ok());

/// Two-digit year first, then four-digit.
const DATE_FORMATS: [&str; 2] = ["%d.%m.%y", "%d.%m.%Y"];

/// Files of one storage listing, split into BASE and OVERRIDE.
#[derive(Clone, Debug, Default)]
pub struct FileCatalog {
    base: Vec<Arc<ScheduleFile>>,
    overrides: Vec<Arc<ScheduleFile>>,
    by_id: BTreeMap<FileId, Arc<ScheduleFile>>,
}

impl FileCatalog {
    pub fn classify(listing: &[FileListing]) -> Self {
        let mut catalog = Self::default();
        for entry in listing {
            let Some(kind) = classify_name(&entry.name) else {
                continue;
            };
            let file = Arc::new(ScheduleFile {
                id: entry.id.clone(),
                name: entry.name.clone(),
                kind,
                modified: entry.modified,
            });
            if file.is_override() {
                catalog.overrides.push(Arc::clone(&file));
            } else {
                catalog.base.push(Arc::clone(&file));
            }
            catalog.by_id.insert(file.id.clone(), file);
        }
        catalog
    }

    pub fn base_files(&self) -> &[Arc<ScheduleFile>] {
        &self.base
    }

    pub fn override_files(&self) -> &[Arc<ScheduleFile>] {
        &self.overrides
    }

    pub fn get(&self, id: &FileId) -> Option<&Arc<ScheduleFile>> {
        self.by_id.get(id)
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<ScheduleFile>> {
        self.base.iter().chain(self.overrides.iter())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn covers_date(file: &ScheduleFile, date: NaiveDate) -> bool {
        file.covers(date)
    }

    /// OVERRIDE files whose coverage includes `date`, in listing order.
    pub fn overrides_for(&self, date: NaiveDate) -> Vec<Arc<ScheduleFile>> {
        self.overrides
            .iter()
            .filter(|file| file.covers(date))
            .cloned()
            .collect()
    }

    /// Earliest start and latest end over all OVERRIDE files.
    pub fn override_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.overrides.iter().fold(None, |span, file| {
            let FileKind::Override { start, end } = file.kind else {
                return span;
            };
            Some(match span {
                None => (start, end),
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
            })
        })
    }
}

/// Classifies one filename. `None` means the file must stay out of the index.
pub fn classify_name(name: &str) -> Option<FileKind> {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if extension.as_deref() != Some("xlsx") || name.starts_with("~$") {
        return None;
    }

    if let Some(caps) = OVERRIDE_NAME.as_ref().and_then(|re| re.captures(name)) {
        let start_text = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let Some(start) = parse_date(start_text) else {
            warn!(file = name, "unparseable override date, skipping");
            return None;
        };
        let end = match caps.get(2) {
            Some(end_text) => match parse_date(end_text.as_str()) {
                Some(end) => end,
                None => {
                    warn!(file = name, "unparseable override end date, skipping");
                    return None;
                }
            },
            None => start,
        };
        if end < start {
            warn!(file = name, %start, %end, "override range is reversed, skipping");
            return None;
        }
        return Some(FileKind::Override { start, end });
    }

    if DATE_LIKE.as_ref().is_some_and(|re| re.is_match(name)) {
        warn!(file = name, "date-like name does not match any override format, skipping");
        return None;
    }

    let group = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
        .to_string();
    Some(FileKind::Base { group })
}

pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS.iter().find_map(|format| {
        NaiveDate::parse_from_str(text, format)
            .ok()
            .filter(|_| year_width_matches(text, format))
    })
}

// %Y would otherwise accept "25" as year 25 and "125" as year 125.
fn year_width_matches(text: &str, format: &str) -> bool {
    let year_digits = text.rsplit('.').next().map(str::len).unwrap_or_default();
    if format.ends_with("%y") {
        year_digits == 2
    } else {
        year_digits == 4
    }
}
