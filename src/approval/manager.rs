use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use duration_str::deserialize_duration;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::agent::definition::AgentId;
use crate::context::Context;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::event::{ApprovalEvent, EventBus};
use crate::registry::journal::{Entity, Mutation, Op};
use crate::registry::store::RegistryStore;
use crate::task::task::Requester;
use crate::utils::thread_context::{NotStartedThreadContext, StartedThreadContext};

use super::error::ApprovalError;
use super::record::{ApprovalId, ApprovalRecord, ApprovalRequest, ApprovalResponse, ApprovalStatus};

pub const SWEEPER_THREAD_NAME: &str = "approval sweeper";
pub const CALLBACK_DECIDER: &str = "callback";
pub const SWEEPER_DECIDER: &str = "sweeper";
pub const CALLBACK_ERROR_REASON: &str = "callback_error";

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApprovalConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A registered decision function: true approves, false rejects. A panic is
/// treated as a rejection with reason `callback_error`.
pub type DecisionCallback = Box<dyn Fn(&ApprovalRequest) -> bool + Send + Sync>;

/// Gates privileged operations behind an out-of-band decision.
///
/// `request_approval` blocks its caller until the request reaches a terminal
/// state: auto-approved against the risk threshold, decided by the
/// registered callback, decided externally via `respond`, or expired by the
/// sweeper.
pub struct ApprovalManager {
    records: Mutex<HashMap<ApprovalId, ApprovalRecord>>,
    waiters: Mutex<HashMap<ApprovalId, Context<Option<ApprovalStatus>>>>,
    callback: Mutex<Option<DecisionCallback>>,
    store: Arc<RegistryStore>,
    bus: EventBus,
}

impl ApprovalManager {
    pub fn new(store: Arc<RegistryStore>, bus: EventBus) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            store,
            bus,
        }
    }

    /// Reloads pending requests from the store; anything already past its
    /// expiry is marked expired before new operations are accepted.
    pub fn load_from_store(&self) -> Result<usize, ApprovalError> {
        let pending = self.store.load_pending_approvals()?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();

        let mut live = 0;
        for mut record in pending {
            if record.is_expired_at(now) {
                record.status = ApprovalStatus::Expired;
                record.response = Some(ApprovalResponse {
                    decided_by: SWEEPER_DECIDER.to_string(),
                    decided_at: now,
                    reason: None,
                });
                self.store.append_approval_history(&record)?;
                debug!(approval_id = %record.id, "expired stale approval on startup");
            } else {
                live += 1;
            }
            records.insert(record.id, record);
        }
        self.persist_pending(&records)?;
        Ok(live)
    }

    pub fn set_decision_callback(&self, callback: DecisionCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Synchronous with respect to its caller: returns only after the
    /// request reaches a terminal state. True means approved.
    pub fn request_approval(&self, request: ApprovalRequest) -> Result<bool, ApprovalError> {
        let mut record = ApprovalRecord::new(request);
        let id = record.id;

        // auto-approval never consults the callback
        if let Some(threshold) = record.request.auto_approve_threshold {
            if record.request.risk_level <= threshold {
                record.status = ApprovalStatus::AutoApproved;
                self.store.append_approval_history(&record)?;
                self.records.lock().unwrap().insert(id, record);
                self.bus.publish(ApprovalEvent::ApprovalRequested(id));
                self.bus.publish(ApprovalEvent::ApprovalDecided {
                    id,
                    status: ApprovalStatus::AutoApproved,
                });
                info!(approval_id = %id, "request auto-approved");
                return Ok(true);
            }
        }

        if let Some(decision) = self.run_callback(&record.request) {
            let (status, reason) = match decision {
                CallbackOutcome::Approved => (ApprovalStatus::Approved, None),
                CallbackOutcome::Rejected => (ApprovalStatus::Rejected, None),
                CallbackOutcome::Panicked => (
                    ApprovalStatus::Rejected,
                    Some(CALLBACK_ERROR_REASON.to_string()),
                ),
            };
            record.status = status;
            record.response = Some(ApprovalResponse {
                decided_by: CALLBACK_DECIDER.to_string(),
                decided_at: Utc::now(),
                reason,
            });
            self.store.append_approval_history(&record)?;
            self.records.lock().unwrap().insert(id, record);
            self.bus.publish(ApprovalEvent::ApprovalRequested(id));
            self.bus
                .publish(ApprovalEvent::ApprovalDecided { id, status });
            return Ok(status == ApprovalStatus::Approved);
        }

        // no callback: park until respond() or the sweeper decides
        let waiter = Context::<Option<ApprovalStatus>>::new();
        {
            let mut records = self.records.lock().unwrap();
            records.insert(id, record);
            self.persist_pending(&records)?;
            self.waiters.lock().unwrap().insert(id, waiter.clone());
        }
        self.bus.publish(ApprovalEvent::ApprovalRequested(id));
        debug!(approval_id = %id, "approval pending an out-of-band decision");

        let status = loop {
            if let Some(status) = waiter.wait_condvar().unwrap() {
                break status;
            }
            // spurious wake-up
        };
        Ok(status == ApprovalStatus::Approved)
    }

    /// Applies an out-of-band decision. False when the approval is unknown
    /// or already terminal; terminal records are never mutated.
    pub fn respond(
        &self,
        id: &ApprovalId,
        approved: bool,
        decided_by: &str,
        reason: Option<String>,
    ) -> bool {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.finalize(
            id,
            status,
            ApprovalResponse {
                decided_by: decided_by.to_string(),
                decided_at: Utc::now(),
                reason,
            },
        )
    }

    pub fn get_pending(&self) -> Vec<ApprovalRecord> {
        let mut pending: Vec<ApprovalRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.id);
        pending
    }

    /// Terminal records, newest first.
    pub fn get_history(&self, limit: usize) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        let mut history = self.store.load_approval_history(limit)?;
        history.reverse();
        Ok(history)
    }

    pub fn get_agent_history(
        &self,
        agent_id: &AgentId,
    ) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        Ok(self
            .get_history(usize::MAX)?
            .into_iter()
            .filter(|record| {
                matches!(&record.request.requested_by, Requester::Agent(id) if id == agent_id)
            })
            .collect())
    }

    /// Expires every pending request whose deadline has passed.
    pub fn sweep(&self) {
        let now = Utc::now();
        let overdue: Vec<ApprovalId> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.is_expired_at(now))
            .map(|record| record.id)
            .collect();

        for id in overdue {
            debug!(approval_id = %id, "expiring overdue approval");
            self.finalize(
                &id,
                ApprovalStatus::Expired,
                ApprovalResponse {
                    decided_by: SWEEPER_DECIDER.to_string(),
                    decided_at: now,
                    reason: None,
                },
            );
        }
    }

    /// Wakes every parked requester with an expired outcome; used on
    /// shutdown so no caller stays blocked.
    pub fn release_waiters(&self) {
        for (_, waiter) in self.waiters.lock().unwrap().drain() {
            waiter.cancel_all(Some(ApprovalStatus::Expired)).unwrap();
        }
    }

    fn finalize(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
        response: ApprovalResponse,
    ) -> bool {
        let record = {
            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.status = status;
            record.response = Some(response);
            let record = record.clone();
            if let Err(err) = self.persist_pending(&records) {
                warn!(approval_id = %id, "could not persist pending approvals: {err}");
            }
            record
        };

        if let Err(err) = self.store.append_approval_history(&record) {
            warn!(approval_id = %id, "could not journal approval transition: {err}");
        }

        if let Some(waiter) = self.waiters.lock().unwrap().remove(id) {
            waiter.cancel_all(Some(status)).unwrap();
        }
        self.bus
            .publish(ApprovalEvent::ApprovalDecided { id: *id, status });
        info!(approval_id = %id, status = %status, "approval decided");
        true
    }

    fn persist_pending(
        &self,
        records: &HashMap<ApprovalId, ApprovalRecord>,
    ) -> Result<(), ApprovalError> {
        let mut pending: Vec<ApprovalRecord> = records
            .values()
            .filter(|record| record.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.id);
        self.store.save_pending_approvals(
            &pending,
            Mutation::new(Op::Update, Entity::Approval, "pending"),
        )?;
        Ok(())
    }

    fn run_callback(&self, request: &ApprovalRequest) -> Option<CallbackOutcome> {
        let callback = self.callback.lock().unwrap();
        let callback = callback.as_ref()?;
        Some(
            match catch_unwind(AssertUnwindSafe(|| callback(request))) {
                Ok(true) => CallbackOutcome::Approved,
                Ok(false) => CallbackOutcome::Rejected,
                Err(_) => {
                    warn!("approval decision callback panicked, treating as rejection");
                    CallbackOutcome::Panicked
                }
            },
        )
    }
}

enum CallbackOutcome {
    Approved,
    Rejected,
    Panicked,
}

/// Spawns the background sweeper transitioning overdue pendings to expired.
pub fn start_sweeper(
    manager: Arc<ApprovalManager>,
    interval: Duration,
) -> StartedThreadContext {
    let callback = move |stop_consumer: EventConsumer<CancellationMessage>| loop {
        manager.sweep();
        if stop_consumer.is_cancelled(interval) {
            break;
        }
    };
    NotStartedThreadContext::new(SWEEPER_THREAD_NAME, callback).start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::record::RiskLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::tempdir;

    fn manager() -> (Arc<ApprovalManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::open(dir.path()).unwrap());
        (
            Arc::new(ApprovalManager::new(store, EventBus::default())),
            dir,
        )
    }

    fn request(risk: RiskLevel) -> ApprovalRequest {
        ApprovalRequest::new("container_install", "install image", Requester::User, risk)
    }

    #[test]
    fn auto_approves_at_or_below_threshold_without_callback() {
        let (manager, _dir) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.set_decision_callback(Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            false
        }));

        let approved = manager
            .request_approval(request(RiskLevel::Low).with_auto_approve_threshold(RiskLevel::Medium))
            .unwrap();

        assert!(approved);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::AutoApproved);
    }

    #[test]
    fn does_not_auto_approve_above_threshold() {
        let (manager, _dir) = manager();
        manager.set_decision_callback(Box::new(|_| false));

        let approved = manager
            .request_approval(
                request(RiskLevel::High).with_auto_approve_threshold(RiskLevel::Medium),
            )
            .unwrap();

        assert!(!approved);
        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::Rejected);
    }

    #[test]
    fn callback_decides_when_registered() {
        let (manager, _dir) = manager();
        manager.set_decision_callback(Box::new(|request| {
            request.risk_level < RiskLevel::Critical
        }));

        assert!(manager.request_approval(request(RiskLevel::High)).unwrap());
        assert!(!manager
            .request_approval(request(RiskLevel::Critical))
            .unwrap());
    }

    #[test]
    fn panicking_callback_rejects_with_reason() {
        let (manager, _dir) = manager();
        manager.set_decision_callback(Box::new(|_| panic!("boom")));

        assert!(!manager.request_approval(request(RiskLevel::High)).unwrap());

        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::Rejected);
        assert_eq!(
            history[0].response.as_ref().unwrap().reason.as_deref(),
            Some(CALLBACK_ERROR_REASON)
        );
    }

    #[test]
    fn respond_wakes_the_blocked_requester() {
        let (manager, _dir) = manager();

        let requester = {
            let manager = manager.clone();
            thread::spawn(move || manager.request_approval(request(RiskLevel::High)).unwrap())
        };

        // wait for the request to park
        let pending = wait_for_pending(&manager);
        assert!(manager.respond(&pending.id, true, "operator", None));
        assert!(requester.join().unwrap());

        // terminal records are immutable
        assert!(!manager.respond(&pending.id, false, "operator", None));
        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::Approved);
        assert_eq!(history[0].response.as_ref().unwrap().decided_by, "operator");
    }

    #[test]
    fn respond_to_unknown_approval_is_false() {
        let (manager, _dir) = manager();
        assert!(!manager.respond(&super::ApprovalId::new(), true, "op", None));
    }

    #[test]
    fn sweeper_expires_overdue_requests() {
        let (manager, _dir) = manager();
        let sweeper = start_sweeper(manager.clone(), Duration::from_millis(20));

        let approved = manager
            .request_approval(
                request(RiskLevel::High)
                    .with_expires_at(Utc::now() + chrono::Duration::milliseconds(100)),
            )
            .unwrap();
        assert!(!approved);

        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::Expired);
        assert_eq!(
            history[0].response.as_ref().unwrap().decided_by,
            SWEEPER_DECIDER
        );

        sweeper.stop_blocking().unwrap();
    }

    #[test]
    fn stale_pendings_expire_on_startup() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RegistryStore::open(dir.path()).unwrap());

        // persist an already-expired pending record
        let stale = ApprovalRecord::new(
            request(RiskLevel::High).with_expires_at(Utc::now() - chrono::Duration::seconds(1)),
        );
        store
            .save_pending_approvals(
                std::slice::from_ref(&stale),
                Mutation::new(Op::Create, Entity::Approval, stale.id.to_string()),
            )
            .unwrap();

        let manager = ApprovalManager::new(store, EventBus::default());
        assert_eq!(manager.load_from_store().unwrap(), 0);
        assert!(manager.get_pending().is_empty());
        let history = manager.get_history(10).unwrap();
        assert_eq!(history[0].status, ApprovalStatus::Expired);
    }

    fn wait_for_pending(manager: &ApprovalManager) -> ApprovalRecord {
        for _ in 0..200 {
            if let Some(record) = manager.get_pending().into_iter().next() {
                return record;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no pending approval appeared");
    }
}
