use crate::error::ResolverError;
use crate::error::Result;
use crate::model::FileId;
use crate::model::FileListing;
use calamine::DataType;
use calamine::Reader as CalamineReader;
use calamine::Xlsx;
use chrono::Duration as ChronoDuration;
use chrono::NaiveDate;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

/// Cell text of the first worksheet of one schedule file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedDocument {
    pub file: FileId,
    pub rows: Vec<Vec<String>>,
}

impl ParsedDocument {
    pub fn new(file: FileId, rows: Vec<Vec<String>>) -> Self {
        Self { file, rows }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|cells| cells.get(col))
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }

    /// Non-empty cells of the top-left `rows` x `cols` window.
    pub fn window(&self, rows: usize, cols: usize) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .take(rows)
            .flat_map(move |cells| cells.iter().take(cols))
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }
}

/// Storage location holding the schedule files.
///
/// Methods block; callers on the async side run them through
/// `spawn_blocking`.
pub trait DocumentStore: Send + Sync {
    fn list(&self) -> Result<Vec<FileListing>>;

    fn modified(&self, id: &FileId) -> Option<SystemTime>;

    fn open(&self, id: &FileId) -> Result<ParsedDocument>;
}

/// Flat directory of `.xlsx` workbooks; the file name is the identifier.
#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: &FileId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl DocumentStore for DirectoryStore {
    fn list(&self) -> Result<Vec<FileListing>> {
        let entries = fs::read_dir(&self.root).map_err(|err| {
            ResolverError::Listing(format!("{}: {err}", self.root.display()))
        })?;
        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            listing.push(FileListing {
                id: FileId::new(name.clone()),
                name,
                modified: metadata.modified()?,
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    fn modified(&self, id: &FileId) -> Option<SystemTime> {
        fs::metadata(self.path_of(id))
            .and_then(|metadata| metadata.modified())
            .ok()
    }

    fn open(&self, id: &FileId) -> Result<ParsedDocument> {
        let bytes = fs::read(self.path_of(id)).map_err(|err| ResolverError::Document {
            file: id.clone(),
            reason: err.to_string(),
        })?;
        let rows = read_first_sheet(&bytes).map_err(|reason| ResolverError::Document {
            file: id.clone(),
            reason,
        })?;
        Ok(ParsedDocument::new(id.clone(), rows))
    }
}

fn read_first_sheet(bytes: &[u8]) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|err| format!("failed to read xlsx workbook: {err}"))?;
    let Some(first) = workbook.sheet_names().first().cloned() else {
        return Ok(Vec::new());
    };
    let range = match workbook.worksheet_range(&first) {
        Some(Ok(range)) => range,
        Some(Err(err)) => return Err(format!("failed to read sheet {first}: {err}")),
        None => return Ok(Vec::new()),
    };
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

fn cell_text(cell: &DataType) -> String {
    match cell {
        DataType::String(s) | DataType::DateTimeIso(s) | DataType::DurationIso(s) => {
            s.trim().to_string()
        }
        DataType::Float(v) => number_text(*v),
        DataType::Int(v) => v.to_string(),
        DataType::Bool(b) => b.to_string(),
        DataType::DateTime(serial) => excel_date(*serial)
            .map(|date| date.format("%d.%m.%Y").to_string())
            .unwrap_or_else(|| number_text(*serial)),
        DataType::Duration(v) => number_text(*v),
        DataType::Error(_) | DataType::Empty => String::new(),
    }
}

// Period numbers and subgroups arrive as floats.
fn number_text(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn excel_date(serial: f64) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(ChronoDuration::days(serial.trunc() as i64))
}
