//! Offline sync queue.
//!
//! A client that loses connectivity keeps capturing attendance actions
//! into an [`OfflineSyncQueue`].  Each item keeps the timestamp it was
//! captured at, so a replayed event lands on the attendance day it
//! belongs to.  [`SyncWorker`] replays the queue through a
//! [`SyncTransport`] as a single task with bounded retries and
//! exponential backoff, and suspends when the connectivity signal drops.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attendance::{ApplyOutcome, AttendanceLedger};
use crate::error::EngineError;
use crate::models::{AttendanceEvent, EventType, GeoPoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub employee_id: String,
    pub location: GeoPoint,
    pub device_id: String,
}

/// One attendance action captured while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub action: EventType,
    pub original_timestamp: NaiveDateTime,
    pub payload: SyncPayload,
    pub dedup_key: String,
    pub attempts: u32,
    pub synced: bool,
}

impl SyncQueueItem {
    pub fn date(&self) -> NaiveDate {
        self.original_timestamp.date()
    }

    /// The event as the server should see it: stamped with the capture
    /// time, never the replay time.
    pub fn to_event(&self) -> AttendanceEvent {
        AttendanceEvent {
            employee_id: self.payload.employee_id.clone(),
            event_type: self.action,
            timestamp: self.original_timestamp,
            location: self.payload.location,
            device_id: self.payload.device_id.clone(),
            dedup_key: self.dedup_key.clone(),
            within_radius_hint: None,
        }
    }
}

/// An item that was dropped instead of replayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWarning {
    pub dedup_key: String,
    pub employee_id: String,
    pub date: NaiveDate,
    pub reason: String,
}

impl SyncWarning {
    fn for_item(item: &SyncQueueItem, reason: impl Into<String>) -> Self {
        Self {
            dedup_key: item.dedup_key.clone(),
            employee_id: item.payload.employee_id.clone(),
            date: item.date(),
            reason: reason.into(),
        }
    }
}

/// Client-held queue of unsynced actions.
#[derive(Debug, Default)]
pub struct OfflineSyncQueue {
    items: Vec<SyncQueueItem>,
    acknowledged: HashSet<String>,
}

impl OfflineSyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture an action.  Returns the generated dedup key.
    pub fn enqueue(
        &mut self,
        action: EventType,
        original_timestamp: NaiveDateTime,
        employee_id: &str,
        location: GeoPoint,
        device_id: &str,
    ) -> String {
        let dedup_key = Uuid::new_v4().to_string();
        self.items.push(SyncQueueItem {
            action,
            original_timestamp,
            payload: SyncPayload {
                employee_id: employee_id.to_string(),
                location,
                device_id: device_id.to_string(),
            },
            dedup_key: dedup_key.clone(),
            attempts: 0,
            synced: false,
        });
        dedup_key
    }

    /// Add an item captured elsewhere, e.g. merged from another
    /// device.  Items whose key is already queued or already
    /// acknowledged are ignored.
    pub fn push(&mut self, item: SyncQueueItem) {
        if self.acknowledged.contains(&item.dedup_key)
            || self.items.iter().any(|i| i.dedup_key == item.dedup_key)
        {
            return;
        }
        self.items.push(item);
    }

    /// Unsynced items in capture order.
    pub fn pending(&self) -> Vec<SyncQueueItem> {
        let mut pending: Vec<_> = self.items.iter().filter(|i| !i.synced).cloned().collect();
        pending.sort_by(|a, b| {
            a.original_timestamp
                .cmp(&b.original_timestamp)
                .then_with(|| a.dedup_key.cmp(&b.dedup_key))
        });
        pending
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_acknowledged(&self, dedup_key: &str) -> bool {
        self.acknowledged.contains(dedup_key)
    }

    pub fn acknowledge(&mut self, dedup_key: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.dedup_key == dedup_key) {
            item.synced = true;
        }
        self.acknowledged.insert(dedup_key.to_string());
    }

    /// Count a failed delivery attempt.  Returns the new count.
    pub fn record_attempt(&mut self, dedup_key: &str) -> u32 {
        match self.items.iter_mut().find(|i| i.dedup_key == dedup_key) {
            Some(item) => {
                item.attempts += 1;
                item.attempts
            }
            None => 0,
        }
    }

    /// Drop an item permanently.
    pub fn discard(&mut self, dedup_key: &str) {
        self.items.retain(|i| i.dedup_key != dedup_key);
    }

    /// Remove items the server has acknowledged.  Their keys are
    /// remembered so a late duplicate is still recognised.
    pub fn purge_synced(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|i| !i.synced);
        before - self.items.len()
    }

    /// Resolve devices that each hold an unsynced check-in for the same
    /// employee and date.  The earliest check-in wins; every pending
    /// item of the other devices for that employee and date is dropped
    /// and reported.
    pub fn resolve_conflicts(&mut self) -> Vec<SyncWarning> {
        let mut check_ins: BTreeMap<(String, NaiveDate), Vec<&SyncQueueItem>> = BTreeMap::new();
        for item in self.items.iter().filter(|i| !i.synced && i.action == EventType::CheckIn) {
            check_ins
                .entry((item.payload.employee_id.clone(), item.date()))
                .or_default()
                .push(item);
        }

        let mut winners: BTreeMap<(String, NaiveDate), String> = BTreeMap::new();
        for (group, items) in check_ins {
            let devices: HashSet<&str> = items.iter().map(|i| i.payload.device_id.as_str()).collect();
            if devices.len() < 2 {
                continue;
            }
            if let Some(first) = items
                .iter()
                .min_by(|a, b| {
                    a.original_timestamp
                        .cmp(&b.original_timestamp)
                        .then_with(|| a.dedup_key.cmp(&b.dedup_key))
                })
            {
                winners.insert(group, first.payload.device_id.clone());
            }
        }

        let mut warnings = Vec::new();
        self.items.retain(|item| {
            if item.synced {
                return true;
            }
            let group = (item.payload.employee_id.clone(), item.date());
            match winners.get(&group) {
                Some(device) if *device != item.payload.device_id => {
                    let warning = SyncWarning::for_item(
                        item,
                        format!(
                            "conflicting session from device {}; device {device} checked in earlier",
                            item.payload.device_id
                        ),
                    );
                    warn!(
                        employee_id = %warning.employee_id,
                        date = %warning.date,
                        dedup_key = %warning.dedup_key,
                        "offline item discarded: {}",
                        warning.reason
                    );
                    warnings.push(warning);
                    false
                }
                _ => true,
            }
        });
        warnings
    }
}

/// The server's answer to one replayed event.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    /// The dedup key was already known.
    Duplicate,
    /// Permanently refused; retrying will not help.
    Rejected(EngineError),
}

/// Delivery failures worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no connectivity")]
    Offline,

    #[error("server unavailable: {0}")]
    Unavailable(String),
}

/// Where replayed events are delivered.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn submit(&self, event: AttendanceEvent) -> Result<SubmitOutcome, TransportError>;
}

/// Delivers straight into an in-process [`AttendanceLedger`].
pub struct LocalTransport {
    ledger: Arc<AttendanceLedger>,
}

impl LocalTransport {
    pub fn new(ledger: Arc<AttendanceLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn submit(&self, event: AttendanceEvent) -> Result<SubmitOutcome, TransportError> {
        Ok(match self.ledger.record_event(&event) {
            Ok(ingest) if ingest.outcome == ApplyOutcome::Duplicate => SubmitOutcome::Duplicate,
            Ok(_) => SubmitOutcome::Accepted,
            Err(err) => SubmitOutcome::Rejected(err),
        })
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplayOutcome {
    /// Every pending item was delivered or discarded.
    Completed,
    /// Connectivity dropped; acknowledged items will not be resent.
    Suspended,
    /// An item ran out of attempts.  Later items were not sent, since
    /// they depend on it.
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub outcome: ReplayOutcome,
    pub acknowledged: usize,
    pub warnings: Vec<SyncWarning>,
}

impl ReplayReport {
    fn new() -> Self {
        Self {
            outcome: ReplayOutcome::Completed,
            acknowledged: 0,
            warnings: Vec::new(),
        }
    }

    fn finish(mut self, outcome: ReplayOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Replays one client's queue.
pub struct SyncWorker {
    queue: Arc<Mutex<OfflineSyncQueue>>,
    policy: RetryPolicy,
}

impl SyncWorker {
    pub fn new(queue: Arc<Mutex<OfflineSyncQueue>>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    fn queue(&self) -> MutexGuard<'_, OfflineSyncQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make one pass over the queue.
    ///
    /// The queue lock is only held between deliveries, never across a
    /// submit or a backoff sleep.
    pub async fn replay(
        &self,
        transport: &dyn SyncTransport,
        connectivity: &mut watch::Receiver<bool>,
    ) -> ReplayReport {
        let mut report = ReplayReport::new();
        if !*connectivity.borrow() {
            return report.finish(ReplayOutcome::Suspended);
        }

        let pending = {
            let mut queue = self.queue();
            report.warnings = queue.resolve_conflicts();
            queue.pending()
        };
        debug!(pending = pending.len(), "replaying offline queue");

        for item in pending {
            {
                let mut queue = self.queue();
                if queue.is_acknowledged(&item.dedup_key) {
                    queue.acknowledge(&item.dedup_key);
                    continue;
                }
            }
            loop {
                if !*connectivity.borrow() {
                    info!(acknowledged = report.acknowledged, "offline replay suspended");
                    return report.finish(ReplayOutcome::Suspended);
                }
                match transport.submit(item.to_event()).await {
                    Ok(SubmitOutcome::Accepted) | Ok(SubmitOutcome::Duplicate) => {
                        self.queue().acknowledge(&item.dedup_key);
                        report.acknowledged += 1;
                        break;
                    }
                    Ok(SubmitOutcome::Rejected(err)) => {
                        let warning = SyncWarning::for_item(&item, err.to_string());
                        warn!(
                            employee_id = %warning.employee_id,
                            dedup_key = %warning.dedup_key,
                            code = err.code(),
                            "offline item rejected by server, discarded"
                        );
                        self.queue().discard(&item.dedup_key);
                        report.warnings.push(warning);
                        break;
                    }
                    Err(err) => {
                        let attempts = self.queue().record_attempt(&item.dedup_key);
                        if attempts >= self.policy.max_attempts {
                            warn!(dedup_key = %item.dedup_key, attempts, %err, "offline item gave up");
                            return report.finish(ReplayOutcome::RetriesExhausted);
                        }
                        let delay = self.policy.delay_for_attempt(attempts);
                        debug!(dedup_key = %item.dedup_key, attempts, ?delay, %err, "retrying offline item");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            Ok(_) = connectivity.wait_for(|online| !*online) => {
                                info!(acknowledged = report.acknowledged, "offline replay suspended");
                                return report.finish(ReplayOutcome::Suspended);
                            }
                        }
                    }
                }
            }
        }

        let purged = self.queue().purge_synced();
        info!(acknowledged = report.acknowledged, purged, warnings = report.warnings.len(), "offline replay completed");
        report.finish(ReplayOutcome::Completed)
    }

    /// Replay until the queue is drained or an item gives up, waiting
    /// out connectivity losses in between.
    pub async fn run(&self, transport: &dyn SyncTransport, mut connectivity: watch::Receiver<bool>) -> ReplayReport {
        let mut total = ReplayReport::new();
        loop {
            let pass = self.replay(transport, &mut connectivity).await;
            total.acknowledged += pass.acknowledged;
            total.warnings.extend(pass.warnings);
            if pass.outcome != ReplayOutcome::Suspended {
                return total.finish(pass.outcome);
            }
            if connectivity.wait_for(|online| *online).await.is_err() {
                return total.finish(ReplayOutcome::Suspended);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DayStatus, Period};
    use crate::rules::{BusinessRulesConfig, RulesSnapshot};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OFFICE: GeoPoint = GeoPoint { lat: 0.0, lng: 0.0 };

    fn ledger() -> Arc<AttendanceLedger> {
        let snapshot = RulesSnapshot::new(
            "test",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            BusinessRulesConfig::default(),
        );
        Arc::new(AttendanceLedger::new(Arc::new(snapshot)))
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    /// Fails the first `failures` submissions, then delivers locally.
    /// Optionally drops connectivity after `drop_after` deliveries.
    struct TestTransport {
        inner: LocalTransport,
        failures: AtomicUsize,
        delivered: AtomicUsize,
        drop_after: Option<(usize, watch::Sender<bool>)>,
    }

    impl TestTransport {
        fn new(ledger: Arc<AttendanceLedger>, failures: usize) -> Self {
            Self {
                inner: LocalTransport::new(ledger),
                failures: AtomicUsize::new(failures),
                delivered: AtomicUsize::new(0),
                drop_after: None,
            }
        }
    }

    #[async_trait]
    impl SyncTransport for TestTransport {
        async fn submit(&self, event: AttendanceEvent) -> Result<SubmitOutcome, TransportError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Unavailable("503".into()));
            }
            let outcome = self.inner.submit(event).await;
            let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, tx)) = &self.drop_after {
                if delivered == *limit {
                    tx.send_replace(false);
                }
            }
            outcome
        }
    }

    fn worker(queue: OfflineSyncQueue) -> (SyncWorker, Arc<Mutex<OfflineSyncQueue>>) {
        let queue = Arc::new(Mutex::new(queue));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        (SyncWorker::new(queue.clone(), policy), queue)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_replay_keeps_capture_time() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(4, 9, 30), "EMP001", OFFICE, "phone-1");
        queue.enqueue(EventType::CheckOut, at(4, 17, 30), "EMP001", OFFICE, "phone-1");
        let (worker, queue) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);

        let report = worker.replay(&LocalTransport::new(ledger.clone()), &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::Completed);
        assert_eq!(report.acknowledged, 2);
        assert!(queue.lock().unwrap().is_empty());

        let day = ledger.day("EMP001", at(4, 0, 0).date()).unwrap();
        assert_eq!(day.check_in, Some(at(4, 9, 30)));
        assert_eq!(day.status, Some(DayStatus::Late));
    }

    #[tokio::test]
    async fn test_conflicting_devices_earliest_check_in_wins() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(4, 9, 5), "EMP001", OFFICE, "tablet");
        queue.enqueue(EventType::CheckOut, at(4, 17, 0), "EMP001", OFFICE, "tablet");
        queue.enqueue(EventType::CheckIn, at(4, 8, 55), "EMP001", OFFICE, "phone");
        queue.enqueue(EventType::CheckOut, at(4, 18, 0), "EMP001", OFFICE, "phone");
        let (worker, _) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);

        let report = worker.replay(&LocalTransport::new(ledger.clone()), &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::Completed);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings.iter().all(|w| w.reason.contains("tablet")));

        let day = ledger.day("EMP001", at(4, 0, 0).date()).unwrap();
        assert_eq!(day.check_in, Some(at(4, 8, 55)));
        assert_eq!(day.check_out, Some(at(4, 18, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(5, 9, 0), "EMP001", OFFICE, "phone-1");
        let (worker, _) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);
        let transport = TestTransport::new(ledger.clone(), 2);

        let report = worker.replay(&transport, &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::Completed);
        assert_eq!(report.acknowledged, 1);
        assert!(ledger.day("EMP001", at(5, 0, 0).date()).unwrap().check_in.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        let key = queue.enqueue(EventType::CheckIn, at(5, 9, 0), "EMP001", OFFICE, "phone-1");
        queue.enqueue(EventType::CheckOut, at(5, 17, 0), "EMP001", OFFICE, "phone-1");
        let (worker, queue) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);
        let transport = TestTransport::new(ledger.clone(), usize::MAX);

        let report = worker.replay(&transport, &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::RetriesExhausted);
        let queue = queue.lock().unwrap();
        let item = queue.pending().into_iter().find(|i| i.dedup_key == key).unwrap();
        assert_eq!(item.attempts, 3);
        assert_eq!(queue.len(), 2);
        assert!(ledger.days_in_period("EMP001", Period::new(2024, 3).unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_suspends_and_resumes_without_resending() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(6, 9, 0), "EMP001", OFFICE, "phone-1");
        queue.enqueue(EventType::BreakStart, at(6, 12, 0), "EMP001", OFFICE, "phone-1");
        queue.enqueue(EventType::BreakEnd, at(6, 12, 30), "EMP001", OFFICE, "phone-1");
        let (worker, queue) = worker(queue);
        let (tx, mut rx) = watch::channel(true);
        let mut transport = TestTransport::new(ledger.clone(), 0);
        transport.drop_after = Some((1, tx));

        let first = worker.replay(&transport, &mut rx).await;
        assert_eq!(first.outcome, ReplayOutcome::Suspended);
        assert_eq!(first.acknowledged, 1);
        assert_eq!(queue.lock().unwrap().pending().len(), 2);

        let (_, tx) = transport.drop_after.take().unwrap();
        tx.send_replace(true);
        let second = worker.replay(&transport, &mut rx).await;
        assert_eq!(second.outcome, ReplayOutcome::Completed);
        assert_eq!(second.acknowledged, 2);
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 3);
        assert_eq!(ledger.day("EMP001", at(6, 0, 0).date()).unwrap().breaks.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_at_start_sends_nothing() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(6, 9, 0), "EMP001", OFFICE, "phone-1");
        let (worker, _) = worker(queue);
        let (_tx, mut rx) = watch::channel(false);
        let transport = TestTransport::new(ledger, 0);

        let report = worker.replay(&transport, &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::Suspended);
        assert_eq!(transport.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_waits_for_connectivity() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(7, 9, 0), "EMP001", OFFICE, "phone-1");
        let (worker, _) = worker(queue);
        let (tx, rx) = watch::channel(false);
        let transport = LocalTransport::new(ledger.clone());

        let run = worker.run(&transport, rx);
        let reconnect = async {
            tokio::task::yield_now().await;
            tx.send_replace(true);
        };
        let (report, _) = tokio::join!(run, reconnect);
        assert_eq!(report.outcome, ReplayOutcome::Completed);
        assert_eq!(report.acknowledged, 1);
    }

    #[test]
    fn test_push_ignores_known_keys() {
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(7, 9, 0), "EMP001", OFFICE, "phone-1");
        let copy = queue.pending()[0].clone();
        queue.push(copy.clone());
        assert_eq!(queue.len(), 1);

        queue.acknowledge(&copy.dedup_key);
        assert_eq!(queue.purge_synced(), 1);
        queue.push(copy);
        assert!(queue.is_empty());
        assert!(queue.pending().is_empty());
    }

    fn online_event(action: EventType, ts: NaiveDateTime, device: &str) -> AttendanceEvent {
        let mut capture = OfflineSyncQueue::new();
        capture.enqueue(action, ts, "EMP001", OFFICE, device);
        capture.pending()[0].to_event()
    }

    #[tokio::test]
    async fn test_replayed_day_lands_after_next_day_check_in() {
        let ledger = ledger();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckIn, at(4, 9, 0), "EMP001", OFFICE, "phone-1");
        queue.enqueue(EventType::CheckOut, at(4, 17, 0), "EMP001", OFFICE, "phone-1");
        ledger.record_event(&online_event(EventType::CheckIn, at(5, 9, 0), "kiosk")).unwrap();
        let (worker, _) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);

        let report = worker.replay(&LocalTransport::new(ledger.clone()), &mut rx).await;
        assert_eq!(report.outcome, ReplayOutcome::Completed);
        assert_eq!(report.acknowledged, 2);
        assert!(report.warnings.is_empty());

        let monday = ledger.day("EMP001", at(4, 0, 0).date()).unwrap();
        assert!(monday.is_finalized());
        assert_eq!(monday.status, Some(DayStatus::Present));
        assert!(ledger.day("EMP001", at(5, 0, 0).date()).unwrap().check_in.is_some());
    }

    #[tokio::test]
    async fn test_queued_check_out_closes_earlier_day() {
        let ledger = ledger();
        ledger.record_event(&online_event(EventType::CheckIn, at(4, 9, 0), "phone-1")).unwrap();
        ledger.record_event(&online_event(EventType::CheckIn, at(5, 9, 0), "kiosk")).unwrap();
        let mut queue = OfflineSyncQueue::new();
        queue.enqueue(EventType::CheckOut, at(4, 17, 0), "EMP001", OFFICE, "phone-1");
        let (worker, _) = worker(queue);
        let (_tx, mut rx) = watch::channel(true);

        let report = worker.replay(&LocalTransport::new(ledger.clone()), &mut rx).await;
        assert_eq!(report.acknowledged, 1);
        assert!(report.warnings.is_empty());

        let monday = ledger.day("EMP001", at(4, 0, 0).date()).unwrap();
        assert_eq!(monday.check_out, Some(at(4, 17, 0)));
        assert_eq!(monday.status, Some(DayStatus::Present));
    }
}
