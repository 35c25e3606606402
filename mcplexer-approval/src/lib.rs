//! Approval gate
//!
//! Rules may demand a human decision before a call dispatches. The gate
//! keeps a pending table (store record + in-memory done-channel), publishes
//! lifecycle events on a broadcast bus for dashboards, and resolves each
//! request exactly once: by an approver, by per-rule timeout, by caller
//! cancellation, or at shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use mcplexer_storage::entities::{ApprovalStatus, ToolApproval};
use mcplexer_storage::{Store, StoreError};

/// Result type for gate operations
pub type GateResult<T> = Result<T, GateError>;

/// Errors surfaced by the approval gate
#[derive(Error, Debug)]
pub enum GateError {
    /// The approval was already resolved; `resolve` is single-shot
    #[error("Approval {id} already resolved")]
    AlreadyResolved { id: String },

    /// Unknown approval id
    #[error("Approval not found: {id}")]
    NotFound { id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the gate caller is asking a human to allow
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub workspace_id: Option<String>,
    pub server_id: Option<String>,
    pub model_hint: Option<String>,
    pub params_summary: Option<String>,
    /// From the matched rule's `approval_timeout`
    pub timeout: Duration,
}

/// Terminal disposition of one approval wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved {
        approved_by: String,
        reason: Option<String>,
    },
    Denied {
        denied_by: String,
        reason: Option<String>,
    },
    TimedOut,
    Cancelled,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// Short reason string for audit records
    pub fn blocked_reason(&self) -> &'static str {
        match self {
            Self::Approved { .. } => "approved",
            Self::Denied { .. } => "denied",
            Self::TimedOut => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Bus events consumed by dashboards
#[derive(Debug, Clone)]
pub enum ApprovalEvent {
    Created(ToolApproval),
    Resolved(ToolApproval),
}

struct Resolution {
    approved: bool,
    resolver: String,
    reason: Option<String>,
}

/// The gate. One per process, shared across sessions.
pub struct ApprovalGate {
    store: Arc<dyn Store>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Resolution>>>,
    bus: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (bus, _) = broadcast::channel(128);
        Self {
            store,
            pending: StdMutex::new(HashMap::new()),
            bus,
        }
    }

    /// Subscribe to created/resolved events
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.bus.subscribe()
    }

    /// Create a pending approval and wait for its resolution. `cancel`
    /// resolving first records the approval as cancelled (sessions pass
    /// their close signal; pass `futures_util::future::pending()` for no
    /// cancellation).
    pub async fn request_approval<C>(&self, request: ApprovalRequest, cancel: C) -> GateResult<ApprovalOutcome>
    where
        C: Future<Output = ()> + Send,
    {
        let mut record = ToolApproval::pending(&request.tool_name);
        record.workspace_id = request.workspace_id.clone();
        record.server_id = request.server_id.clone();
        record.model_hint = request.model_hint.clone();
        record.params_summary = request.params_summary.clone();
        self.store.create_tool_approval(&record).await?;

        let (done_tx, done_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(record.id.clone(), done_tx);

        let _ = self.bus.send(ApprovalEvent::Created(record.clone()));
        debug!(id = %record.id, tool = %record.tool_name, "approval requested");

        let outcome = tokio::select! {
            resolution = done_rx => match resolution {
                Ok(resolution) if resolution.approved => ApprovalOutcome::Approved {
                    approved_by: resolution.resolver,
                    reason: resolution.reason,
                },
                Ok(resolution) => ApprovalOutcome::Denied {
                    denied_by: resolution.resolver,
                    reason: resolution.reason,
                },
                // Sender dropped without a resolution: shutdown
                Err(_) => ApprovalOutcome::Cancelled,
            },
            _ = tokio::time::sleep(request.timeout) => {
                self.finalize(&record.id, ApprovalStatus::Timeout, None, Some("approval timed out")).await;
                return Ok(ApprovalOutcome::TimedOut);
            }
            _ = cancel => {
                self.finalize(&record.id, ApprovalStatus::Cancelled, None, Some("caller went away")).await;
                return Ok(ApprovalOutcome::Cancelled);
            }
        };

        Ok(outcome)
    }

    /// Resolve a pending approval. Idempotent: the second resolver gets
    /// `AlreadyResolved`.
    pub async fn resolve(
        &self,
        id: &str,
        resolver: &str,
        reason: Option<&str>,
        approved: bool,
    ) -> GateResult<ToolApproval> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };

        let record = self
            .store
            .resolve_tool_approval(id, status, Some(resolver), reason, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::Conflict { .. } => GateError::AlreadyResolved { id: id.to_string() },
                StoreError::NotFound { .. } => GateError::NotFound { id: id.to_string() },
                other => GateError::Store(other),
            })?;

        if let Some(done) = self.pending.lock().expect("pending table poisoned").remove(id) {
            let _ = done.send(Resolution {
                approved,
                resolver: resolver.to_string(),
                reason: reason.map(str::to_string),
            });
        }

        let _ = self.bus.send(ApprovalEvent::Resolved(record.clone()));
        info!(id, resolver, approved, "approval resolved");
        Ok(record)
    }

    /// Mark pendings older than `older_than` as timed out. Runs at startup
    /// (catching rows orphaned by a crash) and periodically.
    pub async fn sweep_expired(&self, older_than: Duration) -> GateResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::hours(1));
        let expired = self.store.expire_pending_approvals(cutoff).await?;

        for id in &expired {
            // Anyone still waiting in-process learns about the timeout too.
            self.pending.lock().expect("pending table poisoned").remove(id);
            if let Ok(record) = self.store.get_tool_approval(id).await {
                let _ = self.bus.send(ApprovalEvent::Resolved(record));
            }
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "expired stale approvals");
        }
        Ok(expired.len())
    }

    /// Run the periodic sweep until the returned handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, older_than: Duration) -> tokio::task::JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = gate.sweep_expired(older_than).await {
                    warn!(error = %e, "approval sweep failed");
                }
            }
        })
    }

    /// Cancel everything still pending (process shutdown)
    pub async fn shutdown(&self) {
        let waiters: Vec<(String, oneshot::Sender<Resolution>)> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            pending.drain().collect()
        };
        for (id, done) in waiters {
            drop(done); // receiver sees Cancelled
            if let Err(e) = self
                .store
                .resolve_tool_approval(&id, ApprovalStatus::Cancelled, None, Some("gateway shutdown"), Utc::now())
                .await
            {
                if !matches!(e, StoreError::Conflict { .. }) {
                    warn!(id, error = %e, "failed to cancel approval at shutdown");
                }
            }
        }
    }

    /// Persist a terminal status reached without an explicit resolver
    async fn finalize(&self, id: &str, status: ApprovalStatus, resolver: Option<&str>, reason: Option<&str>) {
        self.pending.lock().expect("pending table poisoned").remove(id);
        match self
            .store
            .resolve_tool_approval(id, status, resolver, reason, Utc::now())
            .await
        {
            Ok(record) => {
                let _ = self.bus.send(ApprovalEvent::Resolved(record));
            }
            // A concurrent resolver won the race; its outcome stands.
            Err(StoreError::Conflict { .. }) => {}
            Err(e) => warn!(id, error = %e, "failed to finalize approval"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;
    use mcplexer_storage::SqliteStore;

    async fn gate() -> (Arc<ApprovalGate>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        (Arc::new(ApprovalGate::new(store.clone() as Arc<dyn Store>)), store)
    }

    fn request(timeout: Duration) -> ApprovalRequest {
        ApprovalRequest {
            tool_name: "github__merge_pr".to_string(),
            workspace_id: None,
            server_id: None,
            model_hint: Some("claude".to_string()),
            params_summary: Some("merge #42".to_string()),
            timeout,
        }
    }

    #[tokio::test]
    async fn approve_unblocks_the_waiter() {
        let (gate, _store) = gate().await;
        let mut events = gate.subscribe();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval(request(Duration::from_secs(10)), future::pending()).await })
        };

        // The created event carries the id to resolve.
        let created = match events.recv().await.unwrap() {
            ApprovalEvent::Created(record) => record,
            other => panic!("expected created event, got {other:?}"),
        };
        gate.resolve(&created.id, "alex", Some("looks fine"), true).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Approved {
                approved_by: "alex".to_string(),
                reason: Some("looks fine".to_string())
            }
        );
    }

    #[tokio::test]
    async fn timeout_resolves_as_timeout() {
        let (gate, store) = gate().await;
        let mut events = gate.subscribe();

        let outcome = gate
            .request_approval(request(Duration::from_millis(50)), future::pending())
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut);

        let created = match events.recv().await.unwrap() {
            ApprovalEvent::Created(record) => record,
            other => panic!("unexpected event {other:?}"),
        };
        let record = store.get_tool_approval(&created.id).await.unwrap();
        assert_eq!(record.status, ApprovalStatus::Timeout);
    }

    #[tokio::test]
    async fn caller_cancellation_resolves_as_cancelled() {
        let (gate, store) = gate().await;
        let mut events = gate.subscribe();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request_approval(request(Duration::from_secs(10)), async {
                    let _ = cancel_rx.await;
                })
                .await
            })
        };

        let created = match events.recv().await.unwrap() {
            ApprovalEvent::Created(record) => record,
            other => panic!("unexpected event {other:?}"),
        };
        cancel_tx.send(()).unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Cancelled);
        assert_eq!(
            store.get_tool_approval(&created.id).await.unwrap().status,
            ApprovalStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn concurrent_resolves_are_single_shot() {
        let (gate, _store) = gate().await;
        let mut events = gate.subscribe();

        let _waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval(request(Duration::from_secs(10)), future::pending()).await })
        };
        let created = match events.recv().await.unwrap() {
            ApprovalEvent::Created(record) => record,
            other => panic!("unexpected event {other:?}"),
        };

        let (a, b) = tokio::join!(
            gate.resolve(&created.id, "alex", None, true),
            gate.resolve(&created.id, "sam", None, false),
        );
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let failure = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(failure, GateError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn sweep_expires_orphaned_rows() {
        let (gate, store) = gate().await;

        // Simulate a pending row left behind by a crash.
        let mut orphan = ToolApproval::pending("fs__delete");
        orphan.created_at = Utc::now() - chrono::Duration::hours(2);
        store.create_tool_approval(&orphan).await.unwrap();

        let swept = gate.sweep_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(
            store.get_tool_approval(&orphan.id).await.unwrap().status,
            ApprovalStatus::Timeout
        );
    }
}
