//! HTTP API for the payroll engine.
//!
//! This module exposes the attendance ledger, the payroll run and the
//! signature-lock workflow as a small JSON API using the
//! [`axum`](https://crates.io/crates/axum) framework.  Callers identify
//! themselves with an `actor` object (`{"role": "admin", "id": "A1"}`)
//! in the request body.  Payroll permissions are checked by the
//! engine and workflow; the attendance admin routes check
//! [`Capability::MarkDay`] here, before touching the ledger.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::attendance::{ApplyOutcome, AttendanceLedger};
use crate::calendar::WorkingCalendar;
use crate::config::EngineConfig;
use crate::engine::{PayRunError, PayRunInput, PayRunResult, PayrollEngine};
use crate::error::{EngineError, ErrorReport, ValidationKind};
use crate::leave::{leave_balance, validate_leave, LeaveBalance};
use crate::models::{
    AttendanceDay, AttendanceEvent, DayStatus, Deductions, Earnings, LeaveRecord, PayrollKey, PayrollRecord, Period,
};
use crate::money::DayCount;
use crate::rules::{load_rules_snapshots_from_dir, RulesRegistry};
use crate::workflow::{Actor, Capability, Clock, PayrollStore, SignatureLockWorkflow, SignatureSubmission, SignatureVault, SystemClock};

/// Application state shared across requests.
pub struct AppState {
    pub ledger: Arc<AttendanceLedger>,
    pub store: Arc<PayrollStore>,
    pub rules: Arc<RulesRegistry>,
    pub engine: PayrollEngine,
    pub workflow: SignatureLockWorkflow,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wire the engine together.  Attendance is ingested under the
    /// registry's default snapshot.
    pub fn new(rules: RulesRegistry, clock: Arc<dyn Clock>) -> Result<Self> {
        let rules = Arc::new(rules);
        let snapshot = rules
            .resolve(None)
            .ok_or_else(|| anyhow::anyhow!("no rules snapshot registered"))?;
        info!(snapshot = %snapshot.id, "attendance rules loaded");
        let ledger = Arc::new(AttendanceLedger::new(snapshot));
        let store = Arc::new(PayrollStore::new());
        let engine = PayrollEngine::new(ledger.clone(), store.clone(), rules.clone(), clock.clone());
        let workflow = SignatureLockWorkflow::new(store.clone(), Arc::new(SignatureVault::new()), clock.clone());
        Ok(Self {
            ledger,
            store,
            rules,
            engine,
            workflow,
            clock,
        })
    }
}

/// Everything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    PayRun(#[from] PayRunError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Engine(err) => engine_status(err),
            ApiError::PayRun(PayRunError::InvalidPeriod { .. }) => StatusCode::BAD_REQUEST,
            ApiError::PayRun(PayRunError::UnknownRulesSnapshot(_)) => StatusCode::NOT_FOUND,
            ApiError::PayRun(PayRunError::Forbidden(err)) => engine_status(err),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn report(&self) -> ErrorReport {
        match self {
            ApiError::Engine(err) | ApiError::PayRun(PayRunError::Forbidden(err)) => err.report(),
            ApiError::PayRun(err) => ErrorReport {
                employee_id: String::new(),
                code: "VALIDATION_ERROR".into(),
                message: err.to_string(),
            },
            ApiError::BadRequest(message) => ErrorReport {
                employee_id: String::new(),
                code: "BAD_REQUEST".into(),
                message: message.clone(),
            },
            // Internal details stay in the log.
            ApiError::Internal(_) => ErrorReport {
                employee_id: String::new(),
                code: "INTERNAL_ERROR".into(),
                message: "internal server error".into(),
            },
        }
    }
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation { kind, .. } => match kind {
            ValidationKind::NotPermitted { .. } => StatusCode::FORBIDDEN,
            ValidationKind::RecordNotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        },
        EngineError::DuplicateSession { .. }
        | EngineError::ImmutableRecord { .. }
        | EngineError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
        EngineError::GeoFenceViolation { .. }
        | EngineError::Verification { .. }
        | EngineError::Calculation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(%self, "request failed");
        }
        (status, Json(self.report())).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the API router around `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/attendance/events", post(record_event_handler))
        .route("/api/attendance/close-day", post(close_day_handler))
        .route("/api/attendance/mark", post(mark_day_handler))
        .route("/api/payroll/calculate", post(calculate_handler))
        .route("/api/payroll/:employee_id/:year/:month", get(get_record_handler))
        .route("/api/payroll/:employee_id/:year/:month/sign", post(sign_handler))
        .route("/api/payroll/:employee_id/:year/:month/approve", post(approve_handler))
        .route("/api/payroll/:employee_id/:year/:month/lock", post(lock_handler))
        .route("/api/payroll/:employee_id/:year/:month/pay", post(pay_handler))
        .route("/api/payroll/:employee_id/:year/:month/amend", post(amend_handler))
        .route("/api/leave/balance", post(leave_balance_handler))
        .with_state(state)
}

fn payroll_key(employee_id: String, year: i32, month: u32) -> Result<PayrollKey, ApiError> {
    let period = Period::new(year, month).ok_or_else(|| ApiError::BadRequest(format!("invalid period {year}-{month}")))?;
    Ok(PayrollKey::new(&employee_id, period))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub duplicate: bool,
    pub day: AttendanceDay,
}

/// Handler for POST /api/attendance/events
async fn record_event_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<AttendanceEvent>,
) -> ApiResult<EventResponse> {
    let ingest = state.ledger.record_event(&event)?;
    Ok(Json(EventResponse {
        duplicate: ingest.outcome == ApplyOutcome::Duplicate,
        day: ingest.day,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDayRequest {
    pub actor: Actor,
    #[serde(default)]
    pub as_of: Option<NaiveDateTime>,
}

/// Handler for POST /api/attendance/close-day
async fn close_day_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CloseDayRequest>,
) -> ApiResult<Vec<AttendanceDay>> {
    request.actor.require(Capability::MarkDay, "")?;
    let now = request.as_of.unwrap_or_else(|| state.clock.now().naive_utc());
    Ok(Json(state.ledger.close_elapsed_days(now)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkDayRequest {
    pub actor: Actor,
    pub employee_id: String,
    pub date: NaiveDate,
    pub status: DayStatus,
}

/// Handler for POST /api/attendance/mark
async fn mark_day_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MarkDayRequest>,
) -> ApiResult<AttendanceDay> {
    request.actor.require(Capability::MarkDay, &request.employee_id)?;
    let day = state.ledger.mark_day(&request.employee_id, request.date, request.status)?;
    Ok(Json(day))
}

#[derive(Debug, Deserialize)]
pub struct CalculateRequest {
    pub actor: Actor,
    #[serde(flatten)]
    pub run: PayRunInput,
}

/// Handler for POST /api/payroll/calculate
async fn calculate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CalculateRequest>,
) -> ApiResult<PayRunResult> {
    let result = tokio::task::spawn_blocking(move || state.engine.run_payroll(request.run, &request.actor))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    Ok(Json(result))
}

/// Handler for GET /api/payroll/:employee_id/:year/:month
async fn get_record_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    let record = state.store.get(&key).ok_or_else(|| {
        EngineError::validation(&key.employee_id, None, ValidationKind::RecordNotFound)
    })?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub actor: Actor,
    /// Base64 signature image.
    pub image: String,
    pub device_id: String,
    pub ip_address: String,
}

/// Handler for POST /api/payroll/:employee_id/:year/:month/sign
async fn sign_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
    Json(request): Json<SignRequest>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    let image = B64
        .decode(request.image.as_bytes())
        .map_err(|err| ApiError::BadRequest(format!("signature image is not base64: {err}")))?;
    let submission = SignatureSubmission {
        image,
        device_id: request.device_id,
        ip_address: request.ip_address,
    };
    Ok(Json(state.workflow.sign(&key, &request.actor, submission)?))
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor: Actor,
}

/// Handler for POST /api/payroll/:employee_id/:year/:month/approve
async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    Ok(Json(state.workflow.approve(&key, &request.actor)?))
}

/// Handler for POST /api/payroll/:employee_id/:year/:month/lock
async fn lock_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    Ok(Json(state.workflow.lock(&key, &request.actor)?))
}

/// Handler for POST /api/payroll/:employee_id/:year/:month/pay
async fn pay_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    Ok(Json(state.workflow.mark_paid(&key, &request.actor)?))
}

#[derive(Debug, Deserialize)]
pub struct AmendRequest {
    pub actor: Actor,
    #[serde(default)]
    pub earnings: Option<Earnings>,
    #[serde(default)]
    pub deductions: Option<Deductions>,
}

/// Handler for POST /api/payroll/:employee_id/:year/:month/amend
async fn amend_handler(
    State(state): State<Arc<AppState>>,
    Path((employee_id, year, month)): Path<(String, i32, u32)>,
    Json(request): Json<AmendRequest>,
) -> ApiResult<PayrollRecord> {
    let key = payroll_key(employee_id, year, month)?;
    let record = state
        .workflow
        .amend(&key, &request.actor, request.earnings, request.deductions)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBalanceRequest {
    pub employee_id: String,
    pub year: i32,
    pub records: Vec<LeaveRecord>,
    #[serde(default)]
    pub unused_paid_last_year: DayCount,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
    #[serde(default)]
    pub rules_snapshot: Option<String>,
}

/// Handler for POST /api/leave/balance
async fn leave_balance_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LeaveBalanceRequest>,
) -> ApiResult<LeaveBalance> {
    let snapshot = state
        .rules
        .resolve(request.rules_snapshot.as_deref())
        .ok_or_else(|| PayRunError::UnknownRulesSnapshot(request.rules_snapshot.clone().unwrap_or_default()))?;
    for record in request.records.iter().filter(|r| r.employee_id == request.employee_id) {
        validate_leave(record, &snapshot.rules.leave)?;
    }
    let calendar = WorkingCalendar::new(request.holidays, &snapshot.rules.payroll);
    Ok(Json(leave_balance(
        &request.records,
        &request.employee_id,
        request.year,
        &snapshot.rules.leave,
        &calendar,
        request.unused_paid_last_year,
    )))
}

/// Launch the API server.  Rules snapshots are loaded from the
/// configured directory; the call blocks until the server terminates.
pub async fn serve(config: &EngineConfig) -> Result<()> {
    let snapshots = load_rules_snapshots_from_dir(&config.rules_dir)?;
    let registry = RulesRegistry::from_snapshots(snapshots, config.rules_version.as_deref());
    let state = Arc::new(AppState::new(registry, Arc::new(SystemClock))?);
    let router = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "payroll engine listening");
    axum::serve(listener, router).await?;
    Ok(())
}
