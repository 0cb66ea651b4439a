//! Payroll engine library crate.
//!
//! This crate turns raw attendance events into per-employee monthly
//! payroll records and guards those records with a dual-signature lock.
//! Applications may embed the pieces directly (`attendance`, `engine`,
//! `workflow`, `sync`) or run the HTTP interface via `api::serve`.

pub mod api;
pub mod attendance;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod leave;
pub mod models;
pub mod money;
pub mod rules;
pub mod smart_late;
pub mod sync;
pub mod workflow;

pub use error::{EngineError, EngineResult};
pub use money::{DayCount, Money};
