//! Data models for the Payroll Engine.
//!
//! The `models` module defines the serialisable structs and enums that
//! flow through the engine: raw attendance events, the per-day
//! attendance aggregate, leave records, and the payroll record with
//! its signatures and audit trail.  These types derive `Serialize` and
//! `Deserialize` so they can be persisted, transmitted over HTTP or
//! held in the offline queue.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::money::{DayCount, Money};
use crate::rules::BusinessRulesConfig;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// The kind of attendance action an employee performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    CheckIn,
    CheckOut,
    BreakStart,
    BreakEnd,
}

/// A single timestamped attendance action.  Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEvent {
    pub employee_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Local office time at which the action was captured.
    pub timestamp: NaiveDateTime,
    pub location: GeoPoint,
    pub device_id: String,
    /// Idempotency key.  Replaying an event with a known key is a no-op.
    pub dedup_key: String,
    /// Client-computed geo-fence result.  Advisory only; the engine
    /// always recomputes the distance itself.
    #[serde(default)]
    pub within_radius_hint: Option<bool>,
}

impl AttendanceEvent {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// One break inside a check-in/check-out window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakInterval {
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DayStatus {
    Present,
    Late,
    HalfDay,
    Absent,
    Holiday,
    Leave,
}

/// Where an attendance day is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayLifecycle {
    /// Still accepting same-day events.
    Open,
    /// Read-only; metrics are final.
    Finalized,
    /// The date elapsed without a checkout.  Terminal, and excluded
    /// from payroll as an error condition.
    Incomplete,
}

/// The finalized (or in-progress) attendance for one employee on one
/// calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceDay {
    pub employee_id: String,
    pub date: NaiveDate,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    /// Append-only; addressed by index within the day.
    pub breaks: Vec<BreakInterval>,
    pub total_working_minutes: i64,
    pub total_break_minutes: i64,
    /// Break time beyond the configured daily allowance.
    pub excess_break_minutes: i64,
    pub is_late: bool,
    pub late_minutes: i64,
    pub overtime_minutes: i64,
    /// `None` until the day is finalized.
    pub status: Option<DayStatus>,
    pub lifecycle: DayLifecycle,
    /// Device that opened the session.
    pub device_id: Option<String>,
    /// Dedup keys of accepted events, in acceptance order.
    #[serde(default)]
    pub accepted_events: Vec<String>,
    pub last_event_at: Option<NaiveDateTime>,
}

impl AttendanceDay {
    pub fn new(employee_id: &str, date: NaiveDate) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            date,
            check_in: None,
            check_out: None,
            breaks: Vec::new(),
            total_working_minutes: 0,
            total_break_minutes: 0,
            excess_break_minutes: 0,
            is_late: false,
            late_minutes: 0,
            overtime_minutes: 0,
            status: None,
            lifecycle: DayLifecycle::Open,
            device_id: None,
            accepted_events: Vec::new(),
            last_event_at: None,
        }
    }

    pub fn total_working_hours(&self) -> f64 {
        self.total_working_minutes as f64 / 60.0
    }

    pub fn overtime_hours(&self) -> f64 {
        self.overtime_minutes as f64 / 60.0
    }

    pub fn is_finalized(&self) -> bool {
        self.lifecycle == DayLifecycle::Finalized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveType {
    Paid,
    Unpaid,
    Sick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

/// A leave request as produced by the (external) approval workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRecord {
    pub employee_id: String,
    #[serde(rename = "type")]
    pub leave_type: LeaveType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub half_day: bool,
    pub status: LeaveStatus,
}

impl LeaveRecord {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// A pay period: one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn last_day(&self) -> Option<NaiveDate> {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1).and_then(|d| d.pred_opt())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Every calendar date in the period, in order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        match (self.first_day(), self.last_day()) {
            (Some(first), Some(last)) => first.iter_days().take_while(|d| *d <= last).collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Identifies one payroll record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollKey {
    pub employee_id: String,
    pub period: Period,
}

impl PayrollKey {
    pub fn new(employee_id: &str, period: Period) -> Self {
        Self {
            employee_id: employee_id.to_string(),
            period,
        }
    }
}

impl fmt::Display for PayrollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.employee_id, self.period)
    }
}

/// Compensation data for one employee, all in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compensation {
    pub basic_salary: Money,
    #[serde(default)]
    pub allowances: Money,
    pub hourly_rate: Money,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveDays {
    pub paid: DayCount,
    pub unpaid: DayCount,
    pub sick: DayCount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Overtime {
    pub minutes: i64,
    pub hours: f64,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deductions {
    pub late_penalty: Money,
    pub half_day_penalty: Money,
    pub unpaid_leave: Money,
    pub total: Money,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Earnings {
    pub basic: Money,
    pub allowances: Money,
    pub overtime_amount: Money,
    pub total: Money,
}

/// Lifecycle of a payroll record.  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayrollStatus {
    Draft,
    Calculated,
    Approved,
    Locked,
    Paid,
}

impl PayrollStatus {
    /// Locked and paid records never change their monetary fields.
    pub fn is_immutable(self) -> bool {
        matches!(self, PayrollStatus::Locked | PayrollStatus::Paid)
    }
}

impl fmt::Display for PayrollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PayrollStatus::Draft => "draft",
            PayrollStatus::Calculated => "calculated",
            PayrollStatus::Approved => "approved",
            PayrollStatus::Locked => "locked",
            PayrollStatus::Paid => "paid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerRole {
    Employee,
    Admin,
}

impl fmt::Display for SignerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerRole::Employee => f.write_str("employee"),
            SignerRole::Admin => f.write_str("admin"),
        }
    }
}

/// Metadata for a captured signature.  The image itself lives in the
/// signature vault; only its SHA-256 is stored on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub owner_role: SignerRole,
    pub signer_id: String,
    pub image_hash: String,
    pub device_id: String,
    pub ip_address: String,
    pub timestamp: DateTime<Utc>,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatures {
    pub employee: Option<Signature>,
    pub admin: Option<Signature>,
}

impl Signatures {
    pub fn slot(&self, role: SignerRole) -> Option<&Signature> {
        match role {
            SignerRole::Employee => self.employee.as_ref(),
            SignerRole::Admin => self.admin.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, role: SignerRole) -> &mut Option<Signature> {
        match role {
            SignerRole::Employee => &mut self.employee,
            SignerRole::Admin => &mut self.admin,
        }
    }
}

/// One immutable entry in a record's audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u32,
    pub action: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// Monetary and attendance results of one calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollFigures {
    pub working_days: u32,
    pub present_days: DayCount,
    pub leave_days: LeaveDays,
    pub late_days: u32,
    pub half_day_conversions: u32,
    pub remainder_lates: u32,
    pub overtime: Overtime,
    pub deductions: Deductions,
    pub earnings: Earnings,
    pub net_payable: Money,
}

/// A per-employee, per-period payroll record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollRecord {
    pub employee_id: String,
    pub month: u32,
    pub year: i32,
    pub rules_snapshot_id: Option<String>,
    /// Copy of the rules the figures were computed with.
    pub rules: Option<BusinessRulesConfig>,
    pub figures: Option<PayrollFigures>,
    pub status: PayrollStatus,
    pub signatures: Signatures,
    pub audit_trail: Vec<AuditEntry>,
    /// Bumped on every write; used for optimistic concurrency.
    pub revision: u64,
}

impl PayrollRecord {
    pub fn new_draft(key: &PayrollKey) -> Self {
        Self {
            employee_id: key.employee_id.clone(),
            month: key.period.month,
            year: key.period.year,
            rules_snapshot_id: None,
            rules: None,
            figures: None,
            status: PayrollStatus::Draft,
            signatures: Signatures::default(),
            audit_trail: Vec::new(),
            revision: 0,
        }
    }

    pub fn key(&self) -> PayrollKey {
        PayrollKey {
            employee_id: self.employee_id.clone(),
            period: Period {
                year: self.year,
                month: self.month,
            },
        }
    }

    pub fn net_payable(&self) -> Option<Money> {
        self.figures.as_ref().map(|f| f.net_payable)
    }

    fn ensure_mutable(&self) -> EngineResult<()> {
        if self.status.is_immutable() {
            let key = self.key();
            return Err(EngineError::ImmutableRecord {
                employee_id: key.employee_id,
                period: key.period,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Store freshly calculated figures together with the rules
    /// snapshot they were computed from.
    pub fn apply_figures(
        &mut self,
        figures: PayrollFigures,
        snapshot_id: &str,
        rules: &BusinessRulesConfig,
    ) -> EngineResult<()> {
        self.ensure_mutable()?;
        self.figures = Some(figures);
        self.rules_snapshot_id = Some(snapshot_id.to_string());
        self.rules = Some(rules.clone());
        Ok(())
    }

    /// Overwrite earnings, recomputing net payable.
    pub fn set_earnings(&mut self, earnings: Earnings) -> EngineResult<()> {
        self.ensure_mutable()?;
        if let Some(figures) = self.figures.as_mut() {
            figures.earnings = earnings;
            figures.net_payable = earnings.total - figures.deductions.total;
        }
        Ok(())
    }

    /// Overwrite deductions, recomputing net payable.
    pub fn set_deductions(&mut self, deductions: Deductions) -> EngineResult<()> {
        self.ensure_mutable()?;
        if let Some(figures) = self.figures.as_mut() {
            figures.deductions = deductions;
            figures.net_payable = figures.earnings.total - deductions.total;
        }
        Ok(())
    }

    /// Append to the audit log.  Permitted in every status.
    pub fn append_audit(&mut self, action: impl Into<String>, actor: impl Into<String>, at: DateTime<Utc>) {
        let sequence = self.audit_trail.len() as u32;
        self.audit_trail.push(AuditEntry {
            sequence,
            action: action.into(),
            actor: actor.into(),
            timestamp: at,
        });
    }
}
