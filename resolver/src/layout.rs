use crate::catalog::parse_date;
use crate::error::ResolverError;
use crate::error::Result;
use crate::model::ActivityRecord;
use crate::model::DaySchedule;
use crate::model::ScheduleFile;
use crate::model::merge_record;
use crate::model::normalize_entity;
use crate::store::ParsedDocument;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;

/// Extracts one entity's activities for one day from one document.
///
/// Implementations are called from blocking worker threads.
pub trait LayoutParser: Send + Sync {
    fn parse(
        &self,
        doc: &ParsedDocument,
        file: &ScheduleFile,
        date: NaiveDate,
        entity: &str,
    ) -> Result<DaySchedule>;
}

/// One activity per row: `day | period | subject | instructor | room | subgroup | note`.
///
/// `day` is a date (`dd.mm.yy` or `dd.mm.yyyy`) or a weekday name in Russian
/// or English. Rows whose period is not a number are skipped, which takes
/// care of header rows.
#[derive(Clone, Copy, Debug, Default)]
pub struct TabularLayout;

const DAY: usize = 0;
const PERIOD: usize = 1;
const SUBJECT: usize = 2;
const INSTRUCTOR: usize = 3;
const ROOM: usize = 4;
const SUBGROUP: usize = 5;
const NOTE: usize = 6;

impl LayoutParser for TabularLayout {
    fn parse(
        &self,
        doc: &ParsedDocument,
        file: &ScheduleFile,
        date: NaiveDate,
        entity: &str,
    ) -> Result<DaySchedule> {
        let entity = normalize_entity(entity);
        if entity.is_empty() {
            return Err(ResolverError::ParseFailure {
                file: file.id.clone(),
                date,
                reason: "empty entity name".to_string(),
            });
        }

        let mut day = DaySchedule::new();
        for row in 0..doc.rows.len() {
            let Some(period) = doc.cell(row, PERIOD).and_then(|p| p.parse::<u32>().ok()) else {
                continue;
            };
            let Some(day_cell) = doc.cell(row, DAY) else {
                continue;
            };
            if !day_matches(day_cell, date) {
                continue;
            }
            let Some(instructor) = doc.cell(row, INSTRUCTOR) else {
                continue;
            };
            if !normalize_entity(instructor).contains(&entity) {
                continue;
            }
            let note = doc.cell(row, NOTE).unwrap_or_default().to_lowercase();
            merge_record(
                &mut day,
                ActivityRecord {
                    period,
                    subject: doc.cell(row, SUBJECT).unwrap_or_default().to_string(),
                    instructor: instructor.to_string(),
                    room: doc.cell(row, ROOM).map(str::to_string),
                    subgroup: doc.cell(row, SUBGROUP).and_then(|s| s.parse().ok()),
                    is_cancelled: note.contains("cancel") || note.contains("отмен"),
                    ..ActivityRecord::default()
                },
            );
        }
        Ok(day)
    }
}

fn day_matches(cell: &str, date: NaiveDate) -> bool {
    let cell = cell.trim();
    if let Some(parsed) = parse_date(cell) {
        return parsed == date;
    }
    parse_weekday(cell) == Some(date.weekday())
}

pub fn parse_weekday(text: &str) -> Option<Weekday> {
    let lowered = text.trim().to_lowercase();
    let weekday = match lowered.as_str() {
        "понедельник" | "пн" => Weekday::Mon,
        "вторник" | "вт" => Weekday::Tue,
        "среда" | "ср" => Weekday::Wed,
        "четверг" | "чт" => Weekday::Thu,
        "пятница" | "пт" => Weekday::Fri,
        "суббота" | "сб" => Weekday::Sat,
        "воскресенье" | "вс" => Weekday::Sun,
        other => return other.parse().ok(),
    };
    Some(weekday)
}
