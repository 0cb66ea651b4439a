//! Attendance aggregation.
//!
//! [`AttendanceDayAggregator`] folds a time-ordered stream of
//! check-in / break / check-out events into one [`AttendanceDay`] per
//! employee per date.  Each event is validated against the current
//! session state; an invalid event is rejected and leaves the day
//! untouched.  Metrics (working time, lateness, overtime, status) are
//! recomputed from the stored timestamps when the day is finalized, so
//! no running counter is ever the source of truth.
//!
//! [`AttendanceLedger`] is the server-side store in front of the
//! aggregator.  It revalidates the geo-fence, serialises ingestion per
//! employee+date, and guarantees at most one open session per employee
//! and date.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult, ValidationKind};
use crate::geo::validate_event_location;
use crate::models::{
    AttendanceDay, AttendanceEvent, BreakInterval, DayLifecycle, DayStatus, EventType, Period,
};
use crate::rules::{AttendanceRules, RulesSnapshot};

/// Session state derived from the day's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    CheckedIn,
    OnBreak,
    CheckedOut,
}

impl SessionState {
    pub fn of(day: &AttendanceDay) -> Self {
        if day.check_in.is_none() {
            SessionState::NoSession
        } else if day.check_out.is_some() {
            SessionState::CheckedOut
        } else if day.breaks.last().is_some_and(|b| b.end.is_none()) {
            SessionState::OnBreak
        } else {
            SessionState::CheckedIn
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SessionState::NoSession => "no session is open",
            SessionState::CheckedIn => "checked in",
            SessionState::OnBreak => "on break",
            SessionState::CheckedOut => "checked out",
        }
    }
}

/// Result of offering an event to a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The dedup key was already recorded; nothing changed.
    Duplicate,
}

fn rejection(day: &AttendanceDay, kind: ValidationKind) -> EngineError {
    EngineError::validation(&day.employee_id, Some(day.date), kind)
}

/// Applies events to attendance days under one set of attendance rules.
pub struct AttendanceDayAggregator<'a> {
    rules: &'a AttendanceRules,
}

impl<'a> AttendanceDayAggregator<'a> {
    pub fn new(rules: &'a AttendanceRules) -> Self {
        Self { rules }
    }

    /// Validate and apply one event.  On error `day` is unchanged.
    pub fn apply(&self, day: &mut AttendanceDay, event: &AttendanceEvent) -> EngineResult<ApplyOutcome> {
        if day.accepted_events.iter().any(|k| k == &event.dedup_key) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if event.dedup_key.is_empty() {
            return Err(rejection(day, ValidationKind::MissingField("dedupKey")));
        }
        if day.lifecycle != DayLifecycle::Open {
            return Err(rejection(day, ValidationKind::DayFinalized));
        }
        if event.date() != day.date {
            return Err(rejection(day, ValidationKind::DateMismatch {
                event_date: event.date(),
                day: day.date,
            }));
        }
        if day.last_event_at.is_some_and(|last| event.timestamp < last) {
            return Err(rejection(day, ValidationKind::OutOfOrder {
                timestamp: event.timestamp,
            }));
        }

        let state = SessionState::of(day);
        match (state, event.event_type) {
            (SessionState::NoSession, EventType::CheckIn) => {
                day.check_in = Some(event.timestamp);
                day.device_id = Some(event.device_id.clone());
            }
            (SessionState::CheckedIn, EventType::BreakStart) => {
                let limit = self.rules.max_breaks_per_day;
                if day.breaks.len() as u32 >= limit {
                    return Err(rejection(day, ValidationKind::BreakLimitExceeded { limit }));
                }
                day.breaks.push(BreakInterval {
                    start: event.timestamp,
                    end: None,
                });
            }
            (SessionState::OnBreak, EventType::BreakEnd) => {
                if let Some(open) = day.breaks.last_mut() {
                    open.end = Some(event.timestamp);
                }
            }
            (SessionState::CheckedIn, EventType::CheckOut) => {
                day.check_out = Some(event.timestamp);
            }
            (state, event_type) => {
                return Err(rejection(day, ValidationKind::InvalidTransition {
                    event: event_type,
                    state: state.describe(),
                }));
            }
        }

        day.accepted_events.push(event.dedup_key.clone());
        day.last_event_at = Some(event.timestamp);
        if event.event_type == EventType::CheckOut {
            self.finalize(day);
        }
        Ok(ApplyOutcome::Applied)
    }

    /// Compute the day's metrics from its timestamps and make it
    /// read-only.  Days without a checkout are left alone.
    pub fn finalize(&self, day: &mut AttendanceDay) {
        let (Some(check_in), Some(check_out)) = (day.check_in, day.check_out) else {
            return;
        };

        let break_secs: i64 = day
            .breaks
            .iter()
            .filter_map(|b| b.end.map(|end| (end - b.start).num_seconds()))
            .sum();
        let span_secs = (check_out - check_in).num_seconds();

        day.total_break_minutes = break_secs / 60;
        day.total_working_minutes = (span_secs - break_secs).max(0) / 60;
        day.excess_break_minutes = (day.total_break_minutes - self.rules.break_duration_minutes).max(0);

        let shift_start = day.date.and_time(self.rules.shift_start_time);
        let elapsed_secs = (check_in - shift_start).num_seconds();
        let grace_secs = self.rules.grace_time_minutes * 60;
        let late_after_secs = grace_secs + self.rules.late_threshold_minutes * 60;
        day.is_late = elapsed_secs > late_after_secs;
        day.late_minutes = if day.is_late {
            (elapsed_secs - grace_secs) / 60
        } else {
            0
        };

        day.overtime_minutes = (day.total_working_minutes - self.rules.overtime_threshold_minutes()).max(0);

        day.status = Some(if day.total_working_minutes < self.rules.half_day_threshold_minutes() {
            DayStatus::HalfDay
        } else if day.is_late {
            DayStatus::Late
        } else {
            DayStatus::Present
        });
        day.lifecycle = DayLifecycle::Finalized;
    }

    /// Move a day whose date has passed without a checkout into the
    /// terminal incomplete state.  Returns whether the day changed.
    pub fn close_if_elapsed(&self, day: &mut AttendanceDay, now: NaiveDateTime) -> bool {
        if day.lifecycle == DayLifecycle::Open && day.date < now.date() {
            day.lifecycle = DayLifecycle::Incomplete;
            return true;
        }
        false
    }

    /// Fold a whole ordered event sequence into a day.  Rejected events
    /// are returned alongside the resulting day.
    pub fn aggregate(
        &self,
        employee_id: &str,
        date: NaiveDate,
        events: &[AttendanceEvent],
    ) -> (AttendanceDay, Vec<EngineError>) {
        let mut day = AttendanceDay::new(employee_id, date);
        let mut rejected = Vec::new();
        for event in events {
            if let Err(err) = self.apply(&mut day, event) {
                rejected.push(err);
            }
        }
        (day, rejected)
    }
}

/// Result of ingesting an event through the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub outcome: ApplyOutcome,
    pub day: AttendanceDay,
}

type DayKey = (String, NaiveDate);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory attendance store with per employee+date serialisation.
pub struct AttendanceLedger {
    snapshot: Arc<RulesSnapshot>,
    days: Mutex<HashMap<DayKey, Arc<Mutex<AttendanceDay>>>>,
    /// Days whose session is currently open.
    open_sessions: Mutex<HashSet<DayKey>>,
}

impl AttendanceLedger {
    pub fn new(snapshot: Arc<RulesSnapshot>) -> Self {
        Self {
            snapshot,
            days: Mutex::new(HashMap::new()),
            open_sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn rules(&self) -> &AttendanceRules {
        &self.snapshot.rules.attendance
    }

    fn slot(&self, employee_id: &str, date: NaiveDate) -> Arc<Mutex<AttendanceDay>> {
        let mut days = lock(&self.days);
        days.entry((employee_id.to_string(), date))
            .or_insert_with(|| Arc::new(Mutex::new(AttendanceDay::new(employee_id, date))))
            .clone()
    }

    fn existing(&self, employee_id: &str, date: NaiveDate) -> Option<Arc<Mutex<AttendanceDay>>> {
        lock(&self.days).get(&(employee_id.to_string(), date)).cloned()
    }

    /// Accept one attendance event.
    ///
    /// The location is revalidated against the office fence first.  A
    /// check-in is guarded by a conditional insert into the open-session
    /// table, so two devices racing to open a session for the same
    /// employee and date cannot both win; the loser gets
    /// [`EngineError::DuplicateSession`].  Sessions on other dates never
    /// block an event, so replayed offline events still land on the day
    /// they were captured on.
    ///
    /// A day is only stored once its first event is accepted.
    pub fn record_event(&self, event: &AttendanceEvent) -> EngineResult<IngestOutcome> {
        validate_event_location(event, self.rules()).inspect_err(|err| {
            warn!(employee_id = %event.employee_id, %err, "event rejected by geo-fence");
        })?;

        let key = (event.employee_id.clone(), event.date());
        let slot = match self.existing(&event.employee_id, key.1) {
            Some(slot) => slot,
            None => {
                let mut days = lock(&self.days);
                match days.get(&key).cloned() {
                    Some(slot) => slot,
                    None => {
                        let mut day = AttendanceDay::new(&event.employee_id, key.1);
                        let outcome = self.ingest(&mut day, event)?;
                        days.insert(key, Arc::new(Mutex::new(day.clone())));
                        return Ok(IngestOutcome { outcome, day });
                    }
                }
            }
        };

        let mut day = lock(&slot);
        if day.accepted_events.contains(&event.dedup_key) {
            debug!(employee_id = %event.employee_id, dedup_key = %event.dedup_key, "duplicate event ignored");
            return Ok(IngestOutcome {
                outcome: ApplyOutcome::Duplicate,
                day: day.clone(),
            });
        }
        let outcome = self.ingest(&mut day, event)?;
        Ok(IngestOutcome {
            outcome,
            day: day.clone(),
        })
    }

    /// Apply `event` to a copy of `day` and keep the copy only if it was
    /// accepted.  Maintains the open-session table.
    fn ingest(&self, day: &mut AttendanceDay, event: &AttendanceEvent) -> EngineResult<ApplyOutcome> {
        let aggregator = AttendanceDayAggregator::new(self.rules());
        let key = (day.employee_id.clone(), day.date);
        let date = day.date;
        let mut candidate = day.clone();
        let applied = match event.event_type {
            EventType::CheckIn => {
                let mut open = lock(&self.open_sessions);
                if open.contains(&key) {
                    warn!(employee_id = %event.employee_id, device_id = %event.device_id, "check-in lost to an open session");
                    return Err(EngineError::DuplicateSession {
                        employee_id: event.employee_id.clone(),
                        open_date: date,
                    });
                }
                let applied = aggregator.apply(&mut candidate, event);
                if applied.is_ok() {
                    open.insert(key);
                }
                applied
            }
            EventType::CheckOut => {
                let applied = aggregator.apply(&mut candidate, event);
                if applied.is_ok() {
                    lock(&self.open_sessions).remove(&key);
                    info!(
                        employee_id = %event.employee_id,
                        %date,
                        working_minutes = candidate.total_working_minutes,
                        status = ?candidate.status,
                        "attendance day finalized"
                    );
                }
                applied
            }
            EventType::BreakStart | EventType::BreakEnd => aggregator.apply(&mut candidate, event),
        };
        let outcome = applied.inspect_err(|err| {
            warn!(employee_id = %event.employee_id, %date, %err, "event rejected");
        })?;
        *day = candidate;
        Ok(outcome)
    }

    /// Mark every open day dated before `now` as incomplete.
    pub fn close_elapsed_days(&self, now: NaiveDateTime) -> Vec<AttendanceDay> {
        let aggregator = AttendanceDayAggregator::new(self.rules());
        let slots: Vec<_> = lock(&self.days).values().cloned().collect();
        let mut closed = Vec::new();
        for slot in slots {
            let mut day = lock(&slot);
            if aggregator.close_if_elapsed(&mut day, now) {
                lock(&self.open_sessions).remove(&(day.employee_id.clone(), day.date));
                closed.push(day.clone());
            }
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "closed elapsed attendance days as incomplete");
        }
        closed
    }

    /// Record a finalized day without events (absence, holiday, leave).
    ///
    /// Only an empty or incomplete day may be overwritten.
    pub fn mark_day(&self, employee_id: &str, date: NaiveDate, status: DayStatus) -> EngineResult<AttendanceDay> {
        if matches!(status, DayStatus::Present | DayStatus::Late | DayStatus::HalfDay) {
            return Err(EngineError::validation(
                employee_id,
                Some(date),
                ValidationKind::Invalid(format!("{status:?} must be derived from attendance events")),
            ));
        }
        let slot = self.slot(employee_id, date);
        let mut day = lock(&slot);
        let replaceable = day.lifecycle == DayLifecycle::Incomplete
            || (day.lifecycle == DayLifecycle::Open && day.check_in.is_none());
        if !replaceable {
            return Err(EngineError::validation(employee_id, Some(date), ValidationKind::DayFinalized));
        }
        let mut marked = AttendanceDay::new(employee_id, date);
        marked.status = Some(status);
        marked.lifecycle = DayLifecycle::Finalized;
        *day = marked;
        debug!(employee_id, %date, ?status, "attendance day marked");
        Ok(day.clone())
    }

    pub fn day(&self, employee_id: &str, date: NaiveDate) -> Option<AttendanceDay> {
        self.existing(employee_id, date).map(|slot| lock(&slot).clone())
    }

    /// All days of one employee within a pay period, ordered by date.
    pub fn days_in_period(&self, employee_id: &str, period: Period) -> Vec<AttendanceDay> {
        let slots: Vec<_> = lock(&self.days)
            .iter()
            .filter(|((emp, date), _)| emp == employee_id && period.contains(*date))
            .map(|(_, slot)| slot.clone())
            .collect();
        let mut days: Vec<AttendanceDay> = slots.iter().map(|slot| lock(slot).clone()).collect();
        days.sort_by_key(|d| d.date);
        days
    }
}
