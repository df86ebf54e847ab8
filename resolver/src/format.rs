use crate::model::ActivityRecord;
use crate::model::DaySchedule;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Renders a merged resolution as display text.
pub trait ScheduleFormatter: Send + Sync {
    fn format(
        &self,
        days: &BTreeMap<NaiveDate, DaySchedule>,
        entity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlainFormatter;

impl ScheduleFormatter for PlainFormatter {
    fn format(
        &self,
        days: &BTreeMap<NaiveDate, DaySchedule>,
        entity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> String {
        let mut out = format!(
            "Schedule for {entity}, {} - {}\n",
            start.format("%d.%m.%Y"),
            end.format("%d.%m.%Y")
        );
        if days.values().all(BTreeMap::is_empty) {
            out.push_str("\nNothing found for this period.\n");
            return out;
        }
        for (date, day) in days {
            let _ = write!(
                out,
                "\n{} ({})\n",
                date.format("%d.%m.%Y"),
                weekday_name(date.weekday())
            );
            if day.is_empty() {
                out.push_str("  no activities\n");
                continue;
            }
            for record in day.values() {
                out.push_str(&record_line(record));
                out.push('\n');
            }
        }
        out
    }
}

fn record_line(record: &ActivityRecord) -> String {
    let mut line = format!("  {}. {}", record.period, record.subject);
    if let Some(room) = &record.room {
        let _ = write!(line, ", room {room}");
    }
    match (&record.group, record.subgroup) {
        (Some(group), Some(subgroup)) => {
            let _ = write!(line, ", {group} (subgroup {subgroup})");
        }
        (Some(group), None) => {
            let _ = write!(line, ", {group}");
        }
        (None, Some(subgroup)) => {
            let _ = write!(line, ", subgroup {subgroup}");
        }
        (None, None) => {}
    }
    if record.is_override {
        line.push_str(" [changed]");
    }
    if record.is_cancelled {
        line.push_str(" [cancelled]");
    }
    line
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
