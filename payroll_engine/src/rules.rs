//! Business rules and immutable rules snapshots.
//!
//! Rules (grace time, lateness, overtime, penalties, leave
//! entitlements) are stored externally as versioned JSON files.  Each
//! file is loaded once into a [`RulesSnapshot`] whose id embeds a
//! digest of the rules, so a payroll record that names a snapshot id
//! names exactly one set of numbers.  Calculations receive a snapshot
//! and never observe later edits.

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::GeoPoint;
use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRules {
    pub shift_start_time: NaiveTime,
    pub grace_time_minutes: i64,
    pub late_threshold_minutes: i64,
    pub half_day_threshold_hours: f64,
    pub overtime_threshold_hours: f64,
    /// Daily break allowance.
    pub break_duration_minutes: i64,
    pub max_breaks_per_day: u32,
    pub office_location: GeoPoint,
    pub geo_fence_radius_meters: f64,
}

impl AttendanceRules {
    pub fn half_day_threshold_minutes(&self) -> i64 {
        (self.half_day_threshold_hours * 60.0).round() as i64
    }

    pub fn overtime_threshold_minutes(&self) -> i64 {
        (self.overtime_threshold_hours * 60.0).round() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarryForwardRules {
    pub enabled: bool,
    /// Cap on unused paid days carried into the next year.
    pub max_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRules {
    pub paid_per_year: u32,
    pub sick_per_year: u32,
    pub max_consecutive: u32,
    pub carry_forward: CarryForwardRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollRules {
    pub overtime_rate_multiplier: f64,
    pub late_penalty_amount: Money,
    pub half_day_penalty_amount: Money,
    pub smart_late_rule_enabled: bool,
    pub lates_for_half_day: u32,
    pub include_weekends: bool,
    pub include_holidays: bool,
}

impl PayrollRules {
    /// The overtime multiplier in basis points (1.5 becomes 15000), so
    /// overtime pay can be computed without floating point.
    pub fn overtime_multiplier_bps(&self) -> i64 {
        (self.overtime_rate_multiplier * 10_000.0).round() as i64
    }
}

/// The full set of configurable business rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRulesConfig {
    pub attendance: AttendanceRules,
    pub leave: LeaveRules,
    pub payroll: PayrollRules,
}

impl Default for BusinessRulesConfig {
    fn default() -> Self {
        Self {
            attendance: AttendanceRules {
                shift_start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
                grace_time_minutes: 10,
                late_threshold_minutes: 5,
                half_day_threshold_hours: 4.0,
                overtime_threshold_hours: 8.0,
                break_duration_minutes: 60,
                max_breaks_per_day: 3,
                office_location: GeoPoint { lat: 0.0, lng: 0.0 },
                geo_fence_radius_meters: 100.0,
            },
            leave: LeaveRules {
                paid_per_year: 12,
                sick_per_year: 6,
                max_consecutive: 10,
                carry_forward: CarryForwardRules {
                    enabled: true,
                    max_days: 5,
                },
            },
            payroll: PayrollRules {
                overtime_rate_multiplier: 1.5,
                late_penalty_amount: Money(0),
                half_day_penalty_amount: Money(0),
                smart_late_rule_enabled: true,
                lates_for_half_day: 3,
                include_weekends: false,
                include_holidays: false,
            },
        }
    }
}

/// An immutable, timestamped copy of the rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesSnapshot {
    /// `<version>@<digest prefix>`.
    pub id: String,
    pub version: String,
    pub captured_at: DateTime<Utc>,
    pub rules: BusinessRulesConfig,
}

impl RulesSnapshot {
    pub fn new(version: &str, captured_at: DateTime<Utc>, rules: BusinessRulesConfig) -> Self {
        let id = format!("{}@{}", version, rules_digest(&rules));
        Self {
            id,
            version: version.to_string(),
            captured_at,
            rules,
        }
    }
}

/// First 12 hex characters of the SHA-256 of the rules' JSON form.
fn rules_digest(rules: &BusinessRulesConfig) -> String {
    let bytes = serde_json::to_vec(rules).unwrap_or_default();
    let hash = hex::encode(Sha256::digest(&bytes));
    hash[..12].to_string()
}

/// On-disk shape of a snapshot file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    version: String,
    captured_at: DateTime<Utc>,
    rules: BusinessRulesConfig,
}

/// Load all rules snapshots from a directory.
///
/// Every `.json` file is parsed as a snapshot file.  Files that fail to
/// parse are logged and skipped rather than failing the whole load.
pub fn load_rules_snapshots_from_dir(path: &Path) -> Result<Vec<RulesSnapshot>> {
    let mut snapshots = Vec::new();
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.path().extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let data = std::fs::read_to_string(entry.path())?;
            match serde_json::from_str::<SnapshotFile>(&data) {
                Ok(file) => {
                    let snapshot = RulesSnapshot::new(&file.version, file.captured_at, file.rules);
                    debug!(id = %snapshot.id, path = ?entry.path(), "loaded rules snapshot");
                    snapshots.push(snapshot);
                }
                Err(err) => warn!(path = ?entry.path(), %err, "failed to parse rules snapshot"),
            }
        }
    }
    Ok(snapshots)
}

/// Read-only lookup of loaded snapshots.
#[derive(Debug, Default)]
pub struct RulesRegistry {
    by_id: HashMap<String, Arc<RulesSnapshot>>,
    latest_by_version: HashMap<String, String>,
    default_id: Option<String>,
}

impl RulesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from loaded snapshots.  The most recently
    /// captured snapshot becomes the default unless `default_version`
    /// names another one.  An empty input registers the built-in rules.
    pub fn from_snapshots(snapshots: Vec<RulesSnapshot>, default_version: Option<&str>) -> Self {
        let mut registry = Self::new();
        let mut snapshots = snapshots;
        if snapshots.is_empty() {
            snapshots.push(RulesSnapshot::new(
                "builtin",
                DateTime::<Utc>::UNIX_EPOCH,
                BusinessRulesConfig::default(),
            ));
        }
        snapshots.sort_by_key(|s| s.captured_at);
        for snapshot in snapshots {
            registry.insert(snapshot);
        }
        if let Some(version) = default_version {
            if let Some(id) = registry.latest_by_version.get(version).cloned() {
                registry.default_id = Some(id);
            } else {
                warn!(version, "default rules version not found, using latest snapshot");
            }
        }
        registry
    }

    pub fn insert(&mut self, snapshot: RulesSnapshot) -> Arc<RulesSnapshot> {
        let id = snapshot.id.clone();
        let snapshot = Arc::new(snapshot);
        self.latest_by_version.insert(snapshot.version.clone(), id.clone());
        self.by_id.insert(id.clone(), snapshot.clone());
        self.default_id = Some(id);
        snapshot
    }

    pub fn get(&self, id: &str) -> Option<Arc<RulesSnapshot>> {
        self.by_id.get(id).cloned()
    }

    pub fn by_version(&self, version: &str) -> Option<Arc<RulesSnapshot>> {
        self.latest_by_version.get(version).and_then(|id| self.get(id))
    }

    /// Resolve a snapshot id or version, falling back to the default.
    pub fn resolve(&self, id_or_version: Option<&str>) -> Option<Arc<RulesSnapshot>> {
        match id_or_version {
            Some(key) => self.get(key).or_else(|| self.by_version(key)),
            None => self.default_id.as_deref().and_then(|id| self.get(id)),
        }
    }
}
