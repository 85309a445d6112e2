use chrono::{Datelike, Days, Months, NaiveDate, Utc};
use serde::Serialize;

/// Half-open calendar-month window `[from, to)` at day granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonthWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl MonthWindow {
    /// The month containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        let from = date - Days::new(u64::from(date.day0()));
        let to = from.checked_add_months(Months::new(1)).unwrap_or(NaiveDate::MAX);
        Self { from, to }
    }

    /// The current month in UTC.
    pub fn current() -> Self {
        Self::containing(Utc::now().date_naive())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date < self.to
    }
}
