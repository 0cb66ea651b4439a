//! Smart late rule.
//!
//! Within one pay period every `lates_for_half_day` late days are
//! converted into a single half-day deduction.  The count is over the
//! whole period (the late days need not be consecutive) and starts from
//! zero in every period.  Leftover late days are penalised as ordinary
//! lates.

use serde::{Deserialize, Serialize};

use crate::models::{AttendanceDay, DayStatus, Period};
use crate::rules::PayrollRules;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartLateOutcome {
    pub late_count: u32,
    pub half_day_conversions: u32,
    pub remainder_lates: u32,
}

/// Split a late-day count into half-day conversions and remainder.
///
/// A threshold of zero disables conversion.
pub fn convert_lates(late_count: u32, lates_for_half_day: u32) -> SmartLateOutcome {
    if lates_for_half_day == 0 {
        return SmartLateOutcome {
            late_count,
            half_day_conversions: 0,
            remainder_lates: late_count,
        };
    }
    SmartLateOutcome {
        late_count,
        half_day_conversions: late_count / lates_for_half_day,
        remainder_lates: late_count % lates_for_half_day,
    }
}

/// Apply the rule to the late days of one employee in one period.
///
/// Days outside `period` are ignored, so a late day from the previous
/// month can never contribute to this month's conversions.
pub fn accumulate(days: &[AttendanceDay], period: Period, rules: &PayrollRules) -> SmartLateOutcome {
    let late_count = days
        .iter()
        .filter(|d| period.contains(d.date) && d.status == Some(DayStatus::Late))
        .count() as u32;
    let threshold = if rules.smart_late_rule_enabled {
        rules.lates_for_half_day
    } else {
        0
    };
    convert_lates(late_count, threshold)
}
