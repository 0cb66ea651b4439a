//! Error taxonomy for the payroll engine.
//!
//! Every failure is scoped to a single record or employee and carries
//! enough context (employee, date, period) for a caller to correct the
//! upstream data and retry.  Nothing here is process-fatal.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::models::{EventType, PayrollStatus, Period, SignerRole};

/// Reasons an input is rejected as invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationKind {
    #[error("{event:?} is not allowed while {state}")]
    InvalidTransition { event: EventType, state: &'static str },

    #[error("event at {timestamp} is earlier than the last accepted event")]
    OutOfOrder { timestamp: chrono::NaiveDateTime },

    #[error("event date {event_date} does not belong to attendance day {day}")]
    DateMismatch { event_date: NaiveDate, day: NaiveDate },

    #[error("attendance day is already finalized")]
    DayFinalized,

    #[error("break limit of {limit} per day reached")]
    BreakLimitExceeded { limit: u32 },

    #[error("{0} signature is missing")]
    MissingSignature(SignerRole),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("{actor} is not permitted to {operation}")]
    NotPermitted { actor: String, operation: &'static str },

    #[error("cannot move payroll record from {from} to {to}")]
    IllegalStatusTransition { from: PayrollStatus, to: PayrollStatus },

    #[error("payroll record not found")]
    RecordNotFound,

    #[error("unknown rules snapshot `{0}`")]
    UnknownRulesSnapshot(String),

    #[error("leave spans {days} consecutive days, the maximum is {max}")]
    LeaveTooLong { days: u32, max: u32 },

    #[error("{0}")]
    Invalid(String),
}

/// Reasons a payroll calculation cannot produce a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalculationKind {
    #[error("no finalized attendance, leave or holiday covers {missing:?}")]
    IncompleteData { missing: Vec<NaiveDate> },

    #[error("period has no working days")]
    NoWorkingDays,

    #[error("invalid period")]
    InvalidPeriod,
}

/// The error type returned by every engine operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("validation error for employee {employee_id}: {kind}")]
    Validation {
        employee_id: String,
        date: Option<NaiveDate>,
        kind: ValidationKind,
    },

    #[error("employee {employee_id} is {distance_m:.0}m from the office, allowed radius is {radius_m:.0}m")]
    GeoFenceViolation {
        employee_id: String,
        date: NaiveDate,
        distance_m: f64,
        radius_m: f64,
    },

    #[error("employee {employee_id} already has an open session (opened on {open_date})")]
    DuplicateSession {
        employee_id: String,
        open_date: NaiveDate,
    },

    #[error("payroll record for {employee_id} {period} is {status} and cannot be modified")]
    ImmutableRecord {
        employee_id: String,
        period: Period,
        status: PayrollStatus,
    },

    #[error("{role} signature on {employee_id} {period} failed verification")]
    Verification {
        employee_id: String,
        period: Period,
        role: SignerRole,
    },

    #[error("calculation failed for employee {employee_id} {period}: {kind}")]
    Calculation {
        employee_id: String,
        period: Period,
        kind: CalculationKind,
    },

    #[error("concurrent update lost for {employee_id}: {detail}")]
    ConcurrencyConflict { employee_id: String, detail: String },
}

impl EngineError {
    pub fn validation(employee_id: &str, date: Option<NaiveDate>, kind: ValidationKind) -> Self {
        EngineError::Validation {
            employee_id: employee_id.to_string(),
            date,
            kind,
        }
    }

    pub fn calculation(employee_id: &str, period: Period, kind: CalculationKind) -> Self {
        EngineError::Calculation {
            employee_id: employee_id.to_string(),
            period,
            kind,
        }
    }

    pub fn conflict(employee_id: &str, detail: impl Into<String>) -> Self {
        EngineError::ConcurrencyConflict {
            employee_id: employee_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Stable code for programmatic handling by API clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { kind, .. } => match kind {
                ValidationKind::MissingSignature(_) => "MISSING_SIGNATURE",
                ValidationKind::InvalidTransition { .. } => "INVALID_TRANSITION",
                ValidationKind::NotPermitted { .. } => "NOT_PERMITTED",
                ValidationKind::RecordNotFound => "RECORD_NOT_FOUND",
                _ => "VALIDATION_ERROR",
            },
            EngineError::GeoFenceViolation { .. } => "GEOFENCE_VIOLATION",
            EngineError::DuplicateSession { .. } => "DUPLICATE_SESSION",
            EngineError::ImmutableRecord { .. } => "IMMUTABLE_RECORD",
            EngineError::Verification { .. } => "VERIFICATION_FAILED",
            EngineError::Calculation { .. } => "CALCULATION_ERROR",
            EngineError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
        }
    }

    /// The employee this error is scoped to.
    pub fn employee_id(&self) -> &str {
        match self {
            EngineError::Validation { employee_id, .. }
            | EngineError::GeoFenceViolation { employee_id, .. }
            | EngineError::DuplicateSession { employee_id, .. }
            | EngineError::ImmutableRecord { employee_id, .. }
            | EngineError::Verification { employee_id, .. }
            | EngineError::Calculation { employee_id, .. }
            | EngineError::ConcurrencyConflict { employee_id, .. } => employee_id,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            employee_id: self.employee_id().to_string(),
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serialisable view of an [`EngineError`], used in batch results and
/// HTTP error bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub employee_id: String,
    pub code: String,
    pub message: String,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
