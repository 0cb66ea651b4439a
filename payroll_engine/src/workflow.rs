//! Signature-lock workflow.
//!
//! A payroll record moves `draft → calculated → approved → locked →
//! paid`, never backwards.  Locking requires both the employee and the
//! admin signature to be present and to verify against the stored
//! image hash.  All writes to a record go through [`PayrollStore`],
//! which compares the record's revision (and, for transitions, its
//! status) immediately before writing, so two concurrent lock attempts
//! cannot both succeed.
//!
//! Permissions are checked once, at the workflow boundary, against an
//! [`Actor`] rather than scattered role strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult, ValidationKind};
use crate::models::{Deductions, Earnings, PayrollKey, PayrollRecord, PayrollStatus, Signature, SignerRole};

/// Source of audit timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always reports the same instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Operations guarded by a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Calculate,
    SignAsEmployee,
    SignAsAdmin,
    Approve,
    Lock,
    MarkPaid,
    Amend,
    /// Mark absent/holiday/leave days and close elapsed days.
    MarkDay,
}

impl Capability {
    fn name(self) -> &'static str {
        match self {
            Capability::Calculate => "calculate payroll",
            Capability::SignAsEmployee => "sign as employee",
            Capability::SignAsAdmin => "sign as admin",
            Capability::Approve => "approve payroll",
            Capability::Lock => "lock payroll",
            Capability::MarkPaid => "mark payroll paid",
            Capability::Amend => "amend payroll figures",
            Capability::MarkDay => "mark attendance days",
        }
    }
}

/// Who is performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "lowercase")]
pub enum Actor {
    Admin(String),
    Employee(String),
}

impl Actor {
    /// Whether this actor may perform `capability` on a record owned
    /// by `record_employee`.
    pub fn can(&self, capability: Capability, record_employee: &str) -> bool {
        match self {
            Actor::Admin(_) => capability != Capability::SignAsEmployee,
            Actor::Employee(id) => capability == Capability::SignAsEmployee && id == record_employee,
        }
    }

    pub fn require(&self, capability: Capability, record_employee: &str) -> EngineResult<()> {
        if self.can(capability, record_employee) {
            return Ok(());
        }
        warn!(actor = %self, record_employee, operation = capability.name(), "permission denied");
        Err(EngineError::validation(
            record_employee,
            None,
            ValidationKind::NotPermitted {
                actor: self.to_string(),
                operation: capability.name(),
            },
        ))
    }

    pub fn signer_role(&self) -> SignerRole {
        match self {
            Actor::Admin(_) => SignerRole::Admin,
            Actor::Employee(_) => SignerRole::Employee,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Admin(id) => write!(f, "admin:{id}"),
            Actor::Employee(id) => write!(f, "employee:{id}"),
        }
    }
}

pub fn image_hash(image: &[u8]) -> String {
    hex::encode(Sha256::digest(image))
}

/// Holds the signature images the record hashes refer to.
#[derive(Default)]
pub struct SignatureVault {
    images: RwLock<HashMap<(PayrollKey, SignerRole), Vec<u8>>>,
}

impl SignatureVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &PayrollKey, role: SignerRole, image: Vec<u8>) {
        let mut images = self.images.write().unwrap_or_else(|e| e.into_inner());
        images.insert((key.clone(), role), image);
    }

    /// Recompute the stored image's hash and compare it with the hash
    /// recorded on the signature.
    pub fn verify(&self, key: &PayrollKey, signature: &Signature) -> bool {
        let images = self.images.read().unwrap_or_else(|e| e.into_inner());
        images
            .get(&(key.clone(), signature.owner_role))
            .is_some_and(|image| image_hash(image) == signature.image_hash)
    }
}

/// In-memory payroll records with optimistic concurrency.
#[derive(Default)]
pub struct PayrollStore {
    records: RwLock<HashMap<PayrollKey, PayrollRecord>>,
}

impl PayrollStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PayrollKey) -> Option<PayrollRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(key).cloned()
    }

    /// Fetch the record, creating a draft if none exists yet.
    pub fn ensure_draft(&self, key: &PayrollKey, actor: &Actor, now: DateTime<Utc>) -> PayrollRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(key.clone())
            .or_insert_with(|| {
                let mut record = PayrollRecord::new_draft(key);
                record.append_audit("created", actor.to_string(), now);
                record
            })
            .clone()
    }

    /// Apply `change` to the record if its revision still equals
    /// `expected_revision`.  The change runs on a copy; the stored
    /// record is only replaced when it succeeds.
    pub fn update<F>(&self, key: &PayrollKey, expected_revision: u64, change: F) -> EngineResult<PayrollRecord>
    where
        F: FnOnce(&mut PayrollRecord) -> EngineResult<()>,
    {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let stored = records.get_mut(key).ok_or_else(|| not_found(key))?;
        if stored.revision != expected_revision {
            return Err(EngineError::conflict(
                &key.employee_id,
                format!(
                    "{key} changed (revision {} != {expected_revision})",
                    stored.revision
                ),
            ));
        }
        let mut next = stored.clone();
        change(&mut next)?;
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    /// Compare-and-swap on status: move to `to` only if the record is
    /// still at `expected_revision` and in one of `from`.  Appends one
    /// audit entry.
    pub fn transition(
        &self,
        key: &PayrollKey,
        expected_revision: u64,
        from: &[PayrollStatus],
        to: PayrollStatus,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> EngineResult<PayrollRecord> {
        self.update(key, expected_revision, |record| {
            if !from.contains(&record.status) {
                return Err(EngineError::conflict(
                    &key.employee_id,
                    format!("{key} is {} and can no longer move to {to}", record.status),
                ));
            }
            record.status = to;
            record.append_audit(to.to_string(), actor.to_string(), now);
            Ok(())
        })
    }
}

fn not_found(key: &PayrollKey) -> EngineError {
    EngineError::validation(&key.employee_id, None, ValidationKind::RecordNotFound)
}

/// A signature being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSubmission {
    pub image: Vec<u8>,
    pub device_id: String,
    pub ip_address: String,
}

/// The state machine over [`PayrollStore`].
pub struct SignatureLockWorkflow {
    store: Arc<PayrollStore>,
    vault: Arc<SignatureVault>,
    clock: Arc<dyn Clock>,
}

impl SignatureLockWorkflow {
    pub fn new(store: Arc<PayrollStore>, vault: Arc<SignatureVault>, clock: Arc<dyn Clock>) -> Self {
        Self { store, vault, clock }
    }

    fn load(&self, key: &PayrollKey) -> EngineResult<PayrollRecord> {
        self.store.get(key).ok_or_else(|| not_found(key))
    }

    fn illegal(key: &PayrollKey, from: PayrollStatus, to: PayrollStatus) -> EngineError {
        EngineError::validation(
            &key.employee_id,
            None,
            ValidationKind::IllegalStatusTransition { from, to },
        )
    }

    fn immutable(record: &PayrollRecord) -> EngineError {
        let key = record.key();
        EngineError::ImmutableRecord {
            employee_id: key.employee_id,
            period: key.period,
            status: record.status,
        }
    }

    /// Capture the actor's signature into their slot.
    pub fn sign(&self, key: &PayrollKey, actor: &Actor, submission: SignatureSubmission) -> EngineResult<PayrollRecord> {
        let role = actor.signer_role();
        let capability = match role {
            SignerRole::Employee => Capability::SignAsEmployee,
            SignerRole::Admin => Capability::SignAsAdmin,
        };
        actor.require(capability, &key.employee_id)?;
        if submission.image.is_empty() {
            return Err(EngineError::validation(
                &key.employee_id,
                None,
                ValidationKind::MissingField("image"),
            ));
        }

        let record = self.load(key)?;
        match record.status {
            PayrollStatus::Calculated | PayrollStatus::Approved => {}
            PayrollStatus::Draft => return Err(Self::illegal(key, record.status, PayrollStatus::Locked)),
            PayrollStatus::Locked | PayrollStatus::Paid => return Err(Self::immutable(&record)),
        }

        let now = self.clock.now();
        let hash = image_hash(&submission.image);
        let image = submission.image;
        let mut signature = Signature {
            owner_role: role,
            signer_id: actor.to_string(),
            image_hash: hash,
            device_id: submission.device_id,
            ip_address: submission.ip_address,
            timestamp: now,
            verified: false,
        };

        // The image is stored only by the writer that wins the revision
        // check, so the vault always matches the committed hash.
        let updated = self.store.update(key, record.revision, |r| {
            self.vault.put(key, role, image);
            signature.verified = self.vault.verify(key, &signature);
            *r.signatures.slot_mut(role) = Some(signature);
            r.append_audit(format!("signed:{role}"), actor.to_string(), now);
            Ok(())
        })?;
        info!(%key, %role, "payroll record signed");
        Ok(updated)
    }

    pub fn approve(&self, key: &PayrollKey, actor: &Actor) -> EngineResult<PayrollRecord> {
        actor.require(Capability::Approve, &key.employee_id)?;
        let record = self.load(key)?;
        if record.status != PayrollStatus::Calculated {
            return Err(Self::illegal(key, record.status, PayrollStatus::Approved));
        }
        let updated = self.store.transition(
            key,
            record.revision,
            &[PayrollStatus::Calculated],
            PayrollStatus::Approved,
            actor,
            self.clock.now(),
        )?;
        info!(%key, "payroll record approved");
        Ok(updated)
    }

    /// Lock the record.  Both signatures must be present and verify.
    pub fn lock(&self, key: &PayrollKey, actor: &Actor) -> EngineResult<PayrollRecord> {
        actor.require(Capability::Lock, &key.employee_id)?;
        let record = self.load(key)?;
        match record.status {
            PayrollStatus::Calculated | PayrollStatus::Approved => {}
            PayrollStatus::Draft => return Err(Self::illegal(key, record.status, PayrollStatus::Locked)),
            PayrollStatus::Locked | PayrollStatus::Paid => {
                return Err(EngineError::conflict(
                    &key.employee_id,
                    format!("{key} was already {}", record.status),
                ))
            }
        }

        for role in [SignerRole::Employee, SignerRole::Admin] {
            let Some(signature) = record.signatures.slot(role) else {
                return Err(EngineError::validation(
                    &key.employee_id,
                    None,
                    ValidationKind::MissingSignature(role),
                ));
            };
            if !signature.verified || !self.vault.verify(key, signature) {
                warn!(%key, %role, "signature failed verification");
                return Err(EngineError::Verification {
                    employee_id: key.employee_id.clone(),
                    period: key.period,
                    role,
                });
            }
        }

        let locked = self.store.transition(
            key,
            record.revision,
            &[PayrollStatus::Calculated, PayrollStatus::Approved],
            PayrollStatus::Locked,
            actor,
            self.clock.now(),
        )?;
        info!(%key, net_payable = ?locked.net_payable(), "payroll record locked");
        Ok(locked)
    }

    /// Record disbursement.  The record stays immutable.
    pub fn mark_paid(&self, key: &PayrollKey, actor: &Actor) -> EngineResult<PayrollRecord> {
        actor.require(Capability::MarkPaid, &key.employee_id)?;
        let record = self.load(key)?;
        if record.status != PayrollStatus::Locked {
            return Err(Self::illegal(key, record.status, PayrollStatus::Paid));
        }
        let paid = self.store.transition(
            key,
            record.revision,
            &[PayrollStatus::Locked],
            PayrollStatus::Paid,
            actor,
            self.clock.now(),
        )?;
        info!(%key, "payroll record marked paid");
        Ok(paid)
    }

    /// Manually amend earnings and/or deductions.  Fails with
    /// [`EngineError::ImmutableRecord`] once the record is locked.
    ///
    /// Signatures attest to specific totals, so an amendment clears
    /// both of them, as a recalculation does.
    pub fn amend(
        &self,
        key: &PayrollKey,
        actor: &Actor,
        earnings: Option<Earnings>,
        deductions: Option<Deductions>,
    ) -> EngineResult<PayrollRecord> {
        actor.require(Capability::Amend, &key.employee_id)?;
        if earnings.is_none() && deductions.is_none() {
            return Err(EngineError::validation(
                &key.employee_id,
                None,
                ValidationKind::MissingField("earnings or deductions"),
            ));
        }
        let record = self.load(key)?;
        if record.status.is_immutable() {
            return Err(Self::immutable(&record));
        }
        if record.figures.is_none() {
            return Err(Self::illegal(key, record.status, PayrollStatus::Calculated));
        }
        let now = self.clock.now();
        let amended = self.store.update(key, record.revision, |r| {
            if let Some(earnings) = earnings {
                r.set_earnings(earnings)?;
            }
            if let Some(deductions) = deductions {
                r.set_deductions(deductions)?;
            }
            r.signatures = Default::default();
            r.append_audit("amended", actor.to_string(), now);
            Ok(())
        })?;
        info!(%key, net_payable = ?amended.net_payable(), "payroll record amended, signatures cleared");
        Ok(amended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PayrollFigures, Period};
    use crate::money::Money;
    use crate::rules::BusinessRulesConfig;

    fn key() -> PayrollKey {
        PayrollKey::new("EMP001", Period::new(2024, 1).unwrap())
    }

    fn admin() -> Actor {
        Actor::Admin("A1".into())
    }

    fn employee() -> Actor {
        Actor::Employee("EMP001".into())
    }

    fn submission(image: &[u8]) -> SignatureSubmission {
        SignatureSubmission {
            image: image.to_vec(),
            device_id: "pad-1".into(),
            ip_address: "10.0.0.5".into(),
        }
    }

    fn figures() -> PayrollFigures {
        serde_json::from_value(serde_json::json!({
            "workingDays": 22, "presentDays": 22.0,
            "leaveDays": {"paid": 0.0, "unpaid": 0.0, "sick": 0.0},
            "lateDays": 0, "halfDayConversions": 0, "remainderLates": 0,
            "overtime": {"minutes": 0, "hours": 0.0, "amount": 0},
            "deductions": {"latePenalty": 0, "halfDayPenalty": 0, "unpaidLeave": 0, "total": 0},
            "earnings": {"basic": 30000, "allowances": 0, "overtimeAmount": 0, "total": 30000},
            "netPayable": 30000
        }))
        .unwrap()
    }

    fn calculated(store: &PayrollStore) {
        let now = Utc::now();
        let draft = store.ensure_draft(&key(), &admin(), now);
        store
            .update(&key(), draft.revision, |r| {
                r.apply_figures(figures(), "builtin@abc", &BusinessRulesConfig::default())?;
                r.status = PayrollStatus::Calculated;
                r.append_audit("calculated", "admin:A1", now);
                Ok(())
            })
            .unwrap();
    }

    fn workflow() -> (SignatureLockWorkflow, Arc<PayrollStore>, Arc<SignatureVault>) {
        let store = Arc::new(PayrollStore::new());
        let vault = Arc::new(SignatureVault::new());
        calculated(&store);
        let wf = SignatureLockWorkflow::new(store.clone(), vault.clone(), Arc::new(SystemClock));
        (wf, store, vault)
    }

    #[test]
    fn test_lock_requires_both_signatures() {
        let (wf, _, _) = workflow();
        wf.sign(&key(), &employee(), submission(b"employee-ink")).unwrap();

        let err = wf.lock(&key(), &admin()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation {
                kind: ValidationKind::MissingSignature(SignerRole::Admin),
                ..
            }
        ));

        let signed = wf.sign(&key(), &admin(), submission(b"admin-ink")).unwrap();
        let audit_before = signed.audit_trail.len();
        let locked = wf.lock(&key(), &admin()).unwrap();
        assert_eq!(locked.status, PayrollStatus::Locked);
        assert_eq!(locked.audit_trail.len(), audit_before + 1);
        assert_eq!(locked.audit_trail.last().unwrap().action, "locked");
    }

    #[test]
    fn test_tampered_image_fails_verification() {
        let (wf, store, vault) = workflow();
        wf.sign(&key(), &employee(), submission(b"employee-ink")).unwrap();
        wf.sign(&key(), &admin(), submission(b"admin-ink")).unwrap();
        vault.put(&key(), SignerRole::Employee, b"forged".to_vec());

        let err = wf.lock(&key(), &admin()).unwrap_err();
        assert!(matches!(err, EngineError::Verification { role: SignerRole::Employee, .. }));
        assert_eq!(store.get(&key()).unwrap().status, PayrollStatus::Calculated);
    }

    #[test]
    fn test_permissions() {
        let (wf, _, _) = workflow();
        let other = Actor::Employee("EMP002".into());
        assert!(wf.sign(&key(), &other, submission(b"x")).is_err());
        assert!(wf.lock(&key(), &employee()).is_err());
        assert!(wf.approve(&key(), &employee()).is_err());
        assert!(!admin().can(Capability::SignAsEmployee, "EMP001"));
    }

    #[test]
    fn test_locked_record_is_immutable() {
        let (wf, store, _) = workflow();
        wf.sign(&key(), &employee(), submission(b"e")).unwrap();
        wf.sign(&key(), &admin(), submission(b"a")).unwrap();
        wf.approve(&key(), &admin()).unwrap();
        wf.lock(&key(), &admin()).unwrap();
        let before = store.get(&key()).unwrap();

        let err = wf
            .amend(&key(), &admin(), None, Some(Deductions::default()))
            .unwrap_err();
        assert!(matches!(err, EngineError::ImmutableRecord { .. }));
        assert_eq!(store.get(&key()).unwrap(), before);

        let err = wf.sign(&key(), &admin(), submission(b"again")).unwrap_err();
        assert!(matches!(err, EngineError::ImmutableRecord { .. }));

        let paid = wf.mark_paid(&key(), &admin()).unwrap();
        assert_eq!(paid.status, PayrollStatus::Paid);
        assert_eq!(paid.figures, before.figures);
    }

    #[test]
    fn test_concurrent_locks_have_one_winner() {
        let (wf, store, _) = workflow();
        wf.sign(&key(), &employee(), submission(b"e")).unwrap();
        wf.sign(&key(), &admin(), submission(b"a")).unwrap();
        let wf = Arc::new(wf);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let wf = wf.clone();
                std::thread::spawn(move || wf.lock(&key(), &admin()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));
        }
        let record = store.get(&key()).unwrap();
        assert_eq!(record.audit_trail.iter().filter(|e| e.action == "locked").count(), 1);
    }

    #[test]
    fn test_amend_clears_signatures() {
        let (wf, _, _) = workflow();
        wf.sign(&key(), &employee(), submission(b"e")).unwrap();
        wf.sign(&key(), &admin(), submission(b"a")).unwrap();

        let deductions = Deductions {
            late_penalty: Money(29000),
            total: Money(29000),
            ..Default::default()
        };
        let amended = wf.amend(&key(), &admin(), None, Some(deductions)).unwrap();
        assert_eq!(amended.net_payable(), Some(Money(1000)));
        assert!(amended.signatures.employee.is_none());
        assert!(amended.signatures.admin.is_none());
        assert_eq!(amended.audit_trail.last().unwrap().action, "amended");

        let err = wf.lock(&key(), &admin()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation {
                kind: ValidationKind::MissingSignature(SignerRole::Employee),
                ..
            }
        ));
    }

    #[test]
    fn test_amend_without_figures_is_rejected() {
        let store = Arc::new(PayrollStore::new());
        let draft = store.ensure_draft(&key(), &admin(), Utc::now());
        let wf = SignatureLockWorkflow::new(store.clone(), Arc::new(SignatureVault::new()), Arc::new(SystemClock));

        let err = wf
            .amend(&key(), &admin(), None, Some(Deductions::default()))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation {
                kind: ValidationKind::IllegalStatusTransition { from: PayrollStatus::Draft, .. },
                ..
            }
        ));
        assert_eq!(store.get(&key()).unwrap(), draft);
    }

    #[test]
    fn test_racing_signatures_keep_vault_consistent() {
        for _ in 0..20 {
            let (wf, store, _) = workflow();
            wf.sign(&key(), &admin(), submission(b"a")).unwrap();
            let wf = Arc::new(wf);

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let wf = wf.clone();
                    std::thread::spawn(move || wf.sign(&key(), &employee(), submission(format!("ink-{i}").as_bytes())))
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(results.iter().any(|r| r.is_ok()));
            for err in results.iter().filter_map(|r| r.as_ref().err()) {
                assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));
            }

            let locked = wf.lock(&key(), &admin()).unwrap();
            assert_eq!(locked.status, PayrollStatus::Locked);
            assert_eq!(store.get(&key()).unwrap().status, PayrollStatus::Locked);
        }
    }

    #[test]
    fn test_stale_revision_is_a_conflict() {
        let (_, store, _) = workflow();
        let record = store.get(&key()).unwrap();
        store.update(&key(), record.revision, |_| Ok(())).unwrap();
        let err = store.update(&key(), record.revision, |_| Ok(())).unwrap_err();
        assert!(matches!(err, EngineError::ConcurrencyConflict { .. }));
    }
}
