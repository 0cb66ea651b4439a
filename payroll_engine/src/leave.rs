//! Leave records as consumed by payroll.
//!
//! Only approved records count.  Days are counted on working days of
//! the pay period; a half-day record contributes half a day for each
//! date it covers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::calendar::WorkingCalendar;
use crate::error::{EngineError, EngineResult, ValidationKind};
use crate::models::{LeaveDays, LeaveRecord, LeaveStatus, LeaveType, Period};
use crate::money::DayCount;
use crate::rules::LeaveRules;

/// Approved leave records of one employee.
pub fn approved_for<'a>(records: &'a [LeaveRecord], employee_id: &'a str) -> impl Iterator<Item = &'a LeaveRecord> {
    records
        .iter()
        .filter(move |r| r.employee_id == employee_id && r.status == LeaveStatus::Approved)
}

/// The leave covering each working day of the period, by date.  When
/// records overlap, the first approved one wins.
pub fn covered_days(
    records: &[LeaveRecord],
    employee_id: &str,
    period: Period,
    calendar: &WorkingCalendar,
) -> BTreeMap<NaiveDate, (LeaveType, DayCount)> {
    let mut covered = BTreeMap::new();
    for record in approved_for(records, employee_id) {
        for date in calendar.working_days(period) {
            if record.covers(date) {
                let amount = if record.half_day {
                    DayCount::half()
                } else {
                    DayCount::whole(1)
                };
                covered.entry(date).or_insert((record.leave_type, amount));
            }
        }
    }
    covered
}

/// Partition the period's approved leave by type.
pub fn leave_days_in_period(
    records: &[LeaveRecord],
    employee_id: &str,
    period: Period,
    calendar: &WorkingCalendar,
) -> LeaveDays {
    let mut days = LeaveDays::default();
    for (leave_type, amount) in covered_days(records, employee_id, period, calendar).into_values() {
        match leave_type {
            LeaveType::Paid => days.paid += amount,
            LeaveType::Unpaid => days.unpaid += amount,
            LeaveType::Sick => days.sick += amount,
        }
    }
    days
}

/// Check a leave record against the leave rules.
pub fn validate_leave(record: &LeaveRecord, rules: &LeaveRules) -> EngineResult<()> {
    let invalid = |kind| EngineError::validation(&record.employee_id, Some(record.start_date), kind);
    if record.end_date < record.start_date {
        return Err(invalid(ValidationKind::Invalid("leave ends before it starts".into())));
    }
    let days = (record.end_date - record.start_date).num_days() as u32 + 1;
    if record.half_day && days > 1 {
        return Err(invalid(ValidationKind::Invalid("a half-day leave must cover a single date".into())));
    }
    if rules.max_consecutive > 0 && days > rules.max_consecutive {
        return Err(invalid(ValidationKind::LeaveTooLong {
            days,
            max: rules.max_consecutive,
        }));
    }
    Ok(())
}

/// Annual leave usage and what is left of the entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBalance {
    pub year: i32,
    pub carried_forward: DayCount,
    pub paid_used: DayCount,
    pub paid_remaining: DayCount,
    pub sick_used: DayCount,
    pub sick_remaining: DayCount,
}

/// Compute an employee's balance for `year`.
///
/// `unused_paid_last_year` is carried in only when carry-forward is
/// enabled, capped at the configured maximum.
pub fn leave_balance(
    records: &[LeaveRecord],
    employee_id: &str,
    year: i32,
    rules: &LeaveRules,
    calendar: &WorkingCalendar,
    unused_paid_last_year: DayCount,
) -> LeaveBalance {
    let mut paid_used = DayCount::ZERO;
    let mut sick_used = DayCount::ZERO;
    for month in 1..=12 {
        let Some(period) = Period::new(year, month) else { continue };
        let days = leave_days_in_period(records, employee_id, period, calendar);
        paid_used += days.paid;
        sick_used += days.sick;
    }

    let carried_forward = if rules.carry_forward.enabled {
        unused_paid_last_year.min(DayCount::whole(rules.carry_forward.max_days))
    } else {
        DayCount::ZERO
    };
    let paid_entitled = DayCount::whole(rules.paid_per_year) + carried_forward;
    let sick_entitled = DayCount::whole(rules.sick_per_year);

    LeaveBalance {
        year,
        carried_forward,
        paid_used,
        paid_remaining: DayCount::from_halves(paid_entitled.halves().saturating_sub(paid_used.halves())),
        sick_used,
        sick_remaining: DayCount::from_halves(sick_entitled.halves().saturating_sub(sick_used.halves())),
    }
}
