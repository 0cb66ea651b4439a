//! Working-day calendar for a pay period.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::Period;
use crate::rules::PayrollRules;

/// Decides which dates of a period are expected working days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCalendar {
    pub holidays: BTreeSet<NaiveDate>,
    pub include_weekends: bool,
    pub include_holidays: bool,
}

impl WorkingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>, rules: &PayrollRules) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
            include_weekends: rules.include_weekends,
            include_holidays: rules.include_holidays,
        }
    }

    pub fn is_weekend(date: NaiveDate) -> bool {
        matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        if !self.include_weekends && Self::is_weekend(date) {
            return false;
        }
        if !self.include_holidays && self.is_holiday(date) {
            return false;
        }
        true
    }

    /// Expected working days of the period, in order.
    pub fn working_days(&self, period: Period) -> Vec<NaiveDate> {
        period
            .dates()
            .into_iter()
            .filter(|d| self.is_working_day(*d))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::BusinessRulesConfig;

    #[test]
    fn test_weekends_and_holidays_excluded_by_default() {
        let rules = BusinessRulesConfig::default().payroll;
        // January 2024 has 31 days, 8 of them weekend days.
        let period = Period::new(2024, 1).unwrap();
        let holiday = NaiveDate::from_ymd_opt(2024, 1, 26).unwrap();
        let calendar = WorkingCalendar::new([holiday], &rules);
        assert_eq!(calendar.working_days(period).len(), 22);
        assert!(!calendar.is_working_day(holiday));
    }

    #[test]
    fn test_include_flags() {
        let mut rules = BusinessRulesConfig::default().payroll;
        rules.include_weekends = true;
        rules.include_holidays = true;
        let period = Period::new(2024, 1).unwrap();
        let calendar = WorkingCalendar::new([NaiveDate::from_ymd_opt(2024, 1, 26).unwrap()], &rules);
        assert_eq!(calendar.working_days(period).len(), 31);
    }
}
