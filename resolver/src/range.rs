use crate::catalog::FileCatalog;
use crate::config::RangePolicy;
use chrono::Datelike;
use chrono::NaiveDate;
use chrono::Weekday;

/// Days to resolve for `[start, end]`, in calendar order, never including
/// `rest_day`.
pub fn plan_days(
    start: NaiveDate,
    end: NaiveDate,
    rest_day: Weekday,
    policy: RangePolicy,
    catalog: &FileCatalog,
) -> Vec<NaiveDate> {
    let (start, end) = match policy {
        RangePolicy::ClampToOverrides => match catalog.override_span() {
            Some((lo, hi)) => (start.max(lo), end.min(hi)),
            None => (start, end),
        },
        RangePolicy::Exact | RangePolicy::OverrideDaysOnly => (start, end),
    };
    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| day.weekday() != rest_day)
        .filter(|day| {
            policy != RangePolicy::OverrideDaysOnly || !catalog.overrides_for(*day).is_empty()
        })
        .collect()
}
