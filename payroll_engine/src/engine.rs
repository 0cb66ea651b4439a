//! Payroll computation engine.
//!
//! The `engine` module turns finalized attendance days, approved leave
//! and a pinned rules snapshot into [`PayrollFigures`] for one employee
//! and one pay period.  [`PayrollEngine::run_payroll`] does this for a
//! whole batch of employees, using the [`rayon`] crate to spread the
//! per-employee work across CPU cores.  Employees share no mutable
//! state, and one employee's failure is reported next to the other
//! employees' results instead of aborting the batch.
//!
//! All money is integer minor units; see [`crate::money`].

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::attendance::AttendanceLedger;
use crate::calendar::WorkingCalendar;
use crate::error::{CalculationKind, EngineError, EngineResult, ErrorReport, ValidationKind};
use crate::leave::{covered_days, leave_days_in_period};
use crate::models::{
    AttendanceDay, Compensation, DayLifecycle, DayStatus, Deductions, Earnings, LeaveRecord, Overtime, PayrollFigures, PayrollKey, PayrollRecord, PayrollStatus, Period,
};
use crate::money::{DayCount, Money};
use crate::rules::{RulesRegistry, RulesSnapshot};
use crate::smart_late;
use crate::workflow::{Actor, Capability, Clock, PayrollStore};

/// Computes payroll figures under one rules snapshot.
pub struct PayrollCalculator<'a> {
    snapshot: &'a RulesSnapshot,
    calendar: WorkingCalendar,
}

impl<'a> PayrollCalculator<'a> {
    pub fn new(snapshot: &'a RulesSnapshot, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        let calendar = WorkingCalendar::new(holidays, &snapshot.rules.payroll);
        Self { snapshot, calendar }
    }

    pub fn calendar(&self) -> &WorkingCalendar {
        &self.calendar
    }

    /// Calculate one employee's figures for `period`.
    ///
    /// `days` may contain days of other periods or employees; they are
    /// ignored.  Every expected working day must be covered by a
    /// finalized attendance day, approved leave or a holiday, and no day
    /// of the period may be left open or incomplete, otherwise the
    /// result is [`CalculationKind::IncompleteData`] naming the dates.
    pub fn calculate(
        &self,
        employee_id: &str,
        period: Period,
        days: &[AttendanceDay],
        leave: &[LeaveRecord],
        compensation: &Compensation,
    ) -> EngineResult<PayrollFigures> {
        let rules = &self.snapshot.rules.payroll;
        let fail = |kind| EngineError::calculation(employee_id, period, kind);

        let working = self.calendar.working_days(period);
        if working.is_empty() {
            return Err(fail(CalculationKind::NoWorkingDays));
        }

        let by_date: BTreeMap<NaiveDate, &AttendanceDay> = days
            .iter()
            .filter(|d| d.employee_id == employee_id && period.contains(d.date))
            .map(|d| (d.date, d))
            .collect();
        let leave_cover = covered_days(leave, employee_id, period, &self.calendar);

        let mut missing: BTreeSet<NaiveDate> = working
            .iter()
            .copied()
            .filter(|date| {
                let attended = by_date.get(date).is_some_and(|d| d.is_finalized());
                !(attended || leave_cover.contains_key(date) || self.calendar.is_holiday(*date))
            })
            .collect();
        missing.extend(
            by_date
                .values()
                .filter(|d| d.lifecycle != DayLifecycle::Finalized)
                .map(|d| d.date),
        );
        if !missing.is_empty() {
            return Err(fail(CalculationKind::IncompleteData {
                missing: missing.into_iter().collect(),
            }));
        }

        let finalized: Vec<AttendanceDay> = by_date.values().map(|d| (*d).clone()).collect();

        let mut present_days = DayCount::ZERO;
        let mut explicit_half_days = 0u32;
        for day in &finalized {
            match day.status {
                Some(DayStatus::Present | DayStatus::Late) => present_days += DayCount::whole(1),
                Some(DayStatus::HalfDay) => {
                    present_days += DayCount::half();
                    explicit_half_days += 1;
                }
                _ => {}
            }
        }

        let leave_days = leave_days_in_period(leave, employee_id, period, &self.calendar);

        let overtime_minutes: i64 = finalized.iter().map(|d| d.overtime_minutes).sum();
        let overtime_amount = compensation
            .hourly_rate
            .scale(overtime_minutes * rules.overtime_multiplier_bps(), 60 * 10_000);

        let lates = smart_late::accumulate(&finalized, period, rules);
        let late_penalty = rules.late_penalty_amount.times(lates.remainder_lates as i64);
        let half_day_penalty = rules
            .half_day_penalty_amount
            .times((explicit_half_days + lates.half_day_conversions) as i64);

        let working_days = working.len() as u32;
        let unpaid_leave =
            per_day_salary(compensation.basic_salary, working_days).scale(leave_days.unpaid.halves() as i64, 2);

        let earnings_total = compensation.basic_salary + compensation.allowances + overtime_amount;
        let deductions_total = late_penalty + half_day_penalty + unpaid_leave;

        Ok(PayrollFigures {
            working_days,
            present_days,
            leave_days,
            late_days: lates.late_count,
            half_day_conversions: lates.half_day_conversions,
            remainder_lates: lates.remainder_lates,
            overtime: Overtime {
                minutes: overtime_minutes,
                hours: overtime_minutes as f64 / 60.0,
                amount: overtime_amount,
            },
            deductions: Deductions {
                late_penalty,
                half_day_penalty,
                unpaid_leave,
                total: deductions_total,
            },
            earnings: Earnings {
                basic: compensation.basic_salary,
                allowances: compensation.allowances,
                overtime_amount,
                total: earnings_total,
            },
            net_payable: earnings_total - deductions_total,
        })
    }
}

/// One employee in a payroll run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmployeePayInput {
    pub employee_id: String,
    pub compensation: Compensation,
}

/// Input to [`PayrollEngine::run_payroll`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRunInput {
    pub year: i32,
    pub month: u32,
    pub employees: Vec<EmployeePayInput>,
    /// Leave records from the approval workflow; only approved ones count.
    #[serde(default)]
    pub leave: Vec<LeaveRecord>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    /// Snapshot id or version.  Defaults to the registry's default.
    #[serde(default)]
    pub rules_snapshot: Option<String>,
}

/// The aggregate result of a payroll run: partial success.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRunResult {
    pub period: Period,
    pub rules_snapshot_id: String,
    pub results: Vec<PayrollRecord>,
    pub errors: Vec<ErrorReport>,
}

/// Problems with the run as a whole, before any employee is touched.
#[derive(Debug, Error)]
pub enum PayRunError {
    #[error("invalid pay period {year}-{month}")]
    InvalidPeriod { year: i32, month: u32 },

    #[error("unknown rules snapshot `{0}`")]
    UnknownRulesSnapshot(String),

    #[error("{0}")]
    Forbidden(EngineError),
}

/// Keys with a calculation currently running.
#[derive(Default)]
struct InFlight {
    keys: Mutex<HashSet<PayrollKey>>,
}

struct InFlightGuard<'a> {
    owner: &'a InFlight,
    key: PayrollKey,
}

impl InFlight {
    fn try_acquire(&self, key: &PayrollKey) -> Option<InFlightGuard<'_>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            owner: self,
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut keys = self.owner.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.remove(&self.key);
    }
}

/// Wires the calculator to attendance, records and rules.
pub struct PayrollEngine {
    ledger: Arc<AttendanceLedger>,
    store: Arc<PayrollStore>,
    rules: Arc<RulesRegistry>,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl PayrollEngine {
    pub fn new(
        ledger: Arc<AttendanceLedger>,
        store: Arc<PayrollStore>,
        rules: Arc<RulesRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            store,
            rules,
            clock,
            in_flight: InFlight::default(),
        }
    }

    /// Calculate and store the record for one employee.
    ///
    /// A second request for the same employee and period while one is
    /// running is rejected with [`EngineError::ConcurrencyConflict`].
    pub fn calculate_employee(
        &self,
        calculator: &PayrollCalculator<'_>,
        input: &EmployeePayInput,
        period: Period,
        leave: &[LeaveRecord],
        actor: &Actor,
    ) -> EngineResult<PayrollRecord> {
        let key = PayrollKey::new(&input.employee_id, period);
        let _guard = self
            .in_flight
            .try_acquire(&key)
            .ok_or_else(|| EngineError::conflict(&key.employee_id, format!("calculation for {key} already running")))?;

        let record = self.store.ensure_draft(&key, actor, self.clock.now());
        match record.status {
            PayrollStatus::Draft | PayrollStatus::Calculated => {}
            PayrollStatus::Approved => {
                return Err(EngineError::validation(
                    &key.employee_id,
                    None,
                    ValidationKind::IllegalStatusTransition {
                        from: record.status,
                        to: PayrollStatus::Calculated,
                    },
                ))
            }
            PayrollStatus::Locked | PayrollStatus::Paid => {
                return Err(EngineError::ImmutableRecord {
                    employee_id: key.employee_id.clone(),
                    period,
                    status: record.status,
                })
            }
        }

        let days = self.ledger.days_in_period(&input.employee_id, period);
        let figures = calculator.calculate(&input.employee_id, period, &days, leave, &input.compensation)?;

        let now = self.clock.now();
        self.store.update(&key, record.revision, |r| {
            r.apply_figures(figures, &calculator.snapshot.id, &calculator.snapshot.rules)?;
            // Signatures attest to specific totals.
            r.signatures = Default::default();
            r.status = PayrollStatus::Calculated;
            let action = if record.status == PayrollStatus::Calculated {
                "recalculated"
            } else {
                "calculated"
            };
            r.append_audit(action, actor.to_string(), now);
            Ok(())
        })
    }

    /// Run payroll for every employee in `input`, in parallel.
    pub fn run_payroll(&self, input: PayRunInput, actor: &Actor) -> Result<PayRunResult, PayRunError> {
        let period = Period::new(input.year, input.month).ok_or(PayRunError::InvalidPeriod {
            year: input.year,
            month: input.month,
        })?;
        let snapshot = self
            .rules
            .resolve(input.rules_snapshot.as_deref())
            .ok_or_else(|| PayRunError::UnknownRulesSnapshot(input.rules_snapshot.clone().unwrap_or_default()))?;
        for employee in &input.employees {
            actor
                .require(Capability::Calculate, &employee.employee_id)
                .map_err(PayRunError::Forbidden)?;
        }

        let calculator = PayrollCalculator::new(&snapshot, input.holidays.iter().copied());
        let leave = &input.leave;

        let outcomes: Vec<EngineResult<PayrollRecord>> = input
            .employees
            .par_iter()
            .map(|employee| self.calculate_employee(&calculator, employee, period, leave, actor))
            .collect();

        let mut results = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(record) => results.push(record),
                Err(err) => {
                    warn!(employee_id = err.employee_id(), %err, "payroll calculation failed");
                    errors.push(err.report());
                }
            }
        }
        info!(
            %period,
            snapshot = %snapshot.id,
            calculated = results.len(),
            failed = errors.len(),
            "payroll run finished"
        );
        Ok(PayRunResult {
            period,
            rules_snapshot_id: snapshot.id.clone(),
            results,
            errors,
        })
    }
}

/// Per-day salary used for unpaid leave deductions.
pub fn per_day_salary(basic_salary: Money, working_days: u32) -> Money {
    basic_salary.scale(1, working_days as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttendanceEvent, EventType, GeoPoint, LeaveStatus, LeaveType};
    use crate::rules::BusinessRulesConfig;
    use crate::workflow::FixedClock;
    use chrono::{Datelike, NaiveDateTime, TimeZone, Utc, Weekday};

    fn period() -> Period {
        // January 2024: 23 weekdays, starts on a Monday.
        Period::new(2024, 1).unwrap()
    }

    fn rules() -> BusinessRulesConfig {
        let mut rules = BusinessRulesConfig::default();
        rules.payroll.late_penalty_amount = Money(100);
        rules.payroll.half_day_penalty_amount = Money(500);
        rules
    }

    fn snapshot(rules: BusinessRulesConfig) -> RulesSnapshot {
        RulesSnapshot::new("test", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), rules)
    }

    fn comp() -> Compensation {
        Compensation {
            basic_salary: Money(230_000),
            allowances: Money(10_000),
            hourly_rate: Money(1_200),
        }
    }

    fn at(date: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, 0).unwrap()
    }

    fn event(kind: EventType, ts: NaiveDateTime) -> AttendanceEvent {
        AttendanceEvent {
            employee_id: "EMP001".into(),
            event_type: kind,
            timestamp: ts,
            location: GeoPoint { lat: 0.0, lng: 0.0 },
            device_id: "phone-1".into(),
            dedup_key: format!("{kind:?}-{ts}"),
            within_radius_hint: None,
        }
    }

    fn weekdays() -> Vec<NaiveDate> {
        period()
            .dates()
            .into_iter()
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .collect()
    }

    /// Attend every weekday 09:00-17:00 except `skip`, arriving at
    /// 09:20 (late) on the first `late` days.
    fn attend(ledger: &AttendanceLedger, skip: &[NaiveDate], late: usize) {
        for (i, date) in weekdays().into_iter().filter(|d| !skip.contains(d)).enumerate() {
            let minute = if i < late { 20 } else { 0 };
            ledger.record_event(&event(EventType::CheckIn, at(date, 9, minute))).unwrap();
            ledger.record_event(&event(EventType::CheckOut, at(date, 17, 0))).unwrap();
        }
    }

    fn ledger(rules: &BusinessRulesConfig) -> Arc<AttendanceLedger> {
        Arc::new(AttendanceLedger::new(Arc::new(snapshot(rules.clone()))))
    }

    #[test]
    fn test_unpaid_leave_uses_per_day_salary() {
        assert_eq!(per_day_salary(Money(30_000), 30), Money(1_000));
        let rules = rules();
        let snap = snapshot(rules.clone());
        let calc = PayrollCalculator::new(&snap, []);
        let ledger = ledger(&rules);
        let leave_dates = [weekdays()[4], weekdays()[5]];
        attend(&ledger, &leave_dates, 0);
        let leave = vec![LeaveRecord {
            employee_id: "EMP001".into(),
            leave_type: LeaveType::Unpaid,
            start_date: leave_dates[0],
            end_date: leave_dates[1],
            half_day: false,
            status: LeaveStatus::Approved,
        }];
        let days = ledger.days_in_period("EMP001", period());
        let figures = calc.calculate("EMP001", period(), &days, &leave, &comp()).unwrap();
        assert_eq!(figures.working_days, 23);
        assert_eq!(figures.present_days, DayCount::whole(21));
        assert_eq!(figures.leave_days.unpaid, DayCount::whole(2));
        // 230000 / 23 = 10000 per day.
        assert_eq!(figures.deductions.unpaid_leave, Money(20_000));
        assert_eq!(figures.earnings.total, Money(240_000));
        assert_eq!(figures.net_payable, Money(220_000));
    }

    #[test]
    fn test_rejected_event_on_leave_day_does_not_block_payroll() {
        let rules = rules();
        let snap = snapshot(rules.clone());
        let calc = PayrollCalculator::new(&snap, []);
        let ledger = ledger(&rules);
        let leave_date = weekdays()[3];
        attend(&ledger, &[leave_date], 0);
        assert!(ledger.record_event(&event(EventType::BreakStart, at(leave_date, 11, 0))).is_err());

        let leave = vec![LeaveRecord {
            employee_id: "EMP001".into(),
            leave_type: LeaveType::Paid,
            start_date: leave_date,
            end_date: leave_date,
            half_day: false,
            status: LeaveStatus::Approved,
        }];
        let days = ledger.days_in_period("EMP001", period());
        let figures = calc.calculate("EMP001", period(), &days, &leave, &comp()).unwrap();
        assert_eq!(figures.leave_days.paid, DayCount::whole(1));
        assert_eq!(figures.deductions.unpaid_leave, Money::ZERO);
    }

    #[test]
    fn test_lates_overtime_and_half_days() {
        let rules = rules();
        let snap = snapshot(rules.clone());
        let calc = PayrollCalculator::new(&snap, []);
        let ledger = ledger(&rules);
        let wd = weekdays();
        attend(&ledger, &wd[20..], 7);
        // Half day on wd[20], ten hours on wd[21] and wd[22].
        ledger.record_event(&event(EventType::CheckIn, at(wd[20], 9, 0))).unwrap();
        ledger.record_event(&event(EventType::CheckOut, at(wd[20], 12, 0))).unwrap();
        for date in &wd[21..] {
            ledger.record_event(&event(EventType::CheckIn, at(*date, 8, 0))).unwrap();
            ledger.record_event(&event(EventType::CheckOut, at(*date, 18, 0))).unwrap();
        }
        let days = ledger.days_in_period("EMP001", period());
        let figures = calc.calculate("EMP001", period(), &days, &[], &comp()).unwrap();

        assert_eq!(figures.late_days, 7);
        assert_eq!(figures.half_day_conversions, 2);
        assert_eq!(figures.remainder_lates, 1);
        assert_eq!(figures.deductions.late_penalty, Money(100));
        // One explicit half day plus two converted.
        assert_eq!(figures.deductions.half_day_penalty, Money(1_500));
        assert_eq!(figures.present_days, DayCount::from_halves(45));
        // 2 x 120 minutes at 1200/h x 1.5.
        assert_eq!(figures.overtime.minutes, 240);
        assert_eq!(figures.overtime.amount, Money(7_200));
    }

    #[test]
    fn test_missing_day_is_incomplete_data() {
        let rules = rules();
        let snap = snapshot(rules.clone());
        let calc = PayrollCalculator::new(&snap, []);
        let ledger = ledger(&rules);
        let wd = weekdays();
        attend(&ledger, &[wd[3]], 0);
        let days = ledger.days_in_period("EMP001", period());
        let err = calc.calculate("EMP001", period(), &days, &[], &comp()).unwrap_err();
        match err {
            EngineError::Calculation {
                kind: CalculationKind::IncompleteData { missing },
                ..
            } => assert_eq!(missing, vec![wd[3]]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_holiday_covers_date() {
        let mut rules = rules();
        rules.payroll.include_holidays = true;
        let snap = snapshot(rules.clone());
        let holiday = weekdays()[0];
        let calc = PayrollCalculator::new(&snap, [holiday]);
        let ledger = ledger(&rules);
        attend(&ledger, &[holiday], 0);
        let days = ledger.days_in_period("EMP001", period());
        let figures = calc.calculate("EMP001", period(), &days, &[], &comp()).unwrap();
        assert_eq!(figures.working_days, 23);
        assert_eq!(figures.present_days, DayCount::whole(22));
    }

    fn engine(rules: &BusinessRulesConfig) -> (PayrollEngine, Arc<AttendanceLedger>, Arc<PayrollStore>) {
        let ledger = ledger(rules);
        let store = Arc::new(PayrollStore::new());
        let registry = Arc::new(RulesRegistry::from_snapshots(vec![snapshot(rules.clone())], None));
        let clock = Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()));
        let engine = PayrollEngine::new(ledger.clone(), store.clone(), registry, clock);
        (engine, ledger, store)
    }

    fn run_input(employees: &[&str]) -> PayRunInput {
        PayRunInput {
            year: 2024,
            month: 1,
            employees: employees
                .iter()
                .map(|id| EmployeePayInput {
                    employee_id: id.to_string(),
                    compensation: comp(),
                })
                .collect(),
            leave: Vec::new(),
            holidays: Vec::new(),
            rules_snapshot: None,
        }
    }

    #[test]
    fn test_batch_is_partial_success() {
        let rules = rules();
        let (engine, ledger, store) = engine(&rules);
        attend(&ledger, &[], 0);
        let admin = Actor::Admin("A1".into());

        let result = engine.run_payroll(run_input(&["EMP001", "EMP404"]), &admin).unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].employee_id, "EMP404");
        assert_eq!(result.errors[0].code, "CALCULATION_ERROR");

        let record = store.get(&PayrollKey::new("EMP001", period())).unwrap();
        assert_eq!(record.status, PayrollStatus::Calculated);
        assert_eq!(record.rules_snapshot_id.as_deref(), Some(result.rules_snapshot_id.as_str()));
        let failed = store.get(&PayrollKey::new("EMP404", period())).unwrap();
        assert_eq!(failed.status, PayrollStatus::Draft);
    }

    #[test]
    fn test_recalculation_is_deterministic() {
        let rules = rules();
        let (engine, ledger, _) = engine(&rules);
        attend(&ledger, &[], 3);
        let admin = Actor::Admin("A1".into());

        let first = engine.run_payroll(run_input(&["EMP001"]), &admin).unwrap();
        let second = engine.run_payroll(run_input(&["EMP001"]), &admin).unwrap();
        let a = serde_json::to_vec(&first.results[0].figures).unwrap();
        let b = serde_json::to_vec(&second.results[0].figures).unwrap();
        assert_eq!(a, b);
        assert_eq!(second.results[0].audit_trail.last().unwrap().action, "recalculated");
    }

    #[test]
    fn test_locked_record_is_not_recalculated() {
        let rules = rules();
        let (engine, ledger, store) = engine(&rules);
        attend(&ledger, &[], 0);
        let admin = Actor::Admin("A1".into());
        engine.run_payroll(run_input(&["EMP001"]), &admin).unwrap();

        let key = PayrollKey::new("EMP001", period());
        let record = store.get(&key).unwrap();
        store
            .update(&key, record.revision, |r| {
                r.status = PayrollStatus::Locked;
                Ok(())
            })
            .unwrap();
        let before = store.get(&key).unwrap();

        let result = engine.run_payroll(run_input(&["EMP001"]), &admin).unwrap();
        assert_eq!(result.errors[0].code, "IMMUTABLE_RECORD");
        assert_eq!(store.get(&key).unwrap(), before);
    }

    #[test]
    fn test_same_key_is_not_calculated_twice_at_once() {
        let rules = rules();
        let (engine, _, _) = engine(&rules);
        let key = PayrollKey::new("EMP001", period());
        let _held = engine.in_flight.try_acquire(&key).unwrap();
        let snap = snapshot(rules);
        let calc = PayrollCalculator::new(&snap, []);
        let input = EmployeePayInput {
            employee_id: "EMP001".into(),
            compensation: comp(),
        };
        let err = engine
            .calculate_employee(&calc, &input, period(), &[], &Actor::Admin("A1".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));
    }

    #[test]
    fn test_employee_cannot_run_payroll() {
        let rules = rules();
        let (engine, _, _) = engine(&rules);
        let result = engine.run_payroll(run_input(&["EMP001"]), &Actor::Employee("EMP001".into()));
        assert!(matches!(result, Err(PayRunError::Forbidden(_))));
    }
}
