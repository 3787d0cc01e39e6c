use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ShareId;

/// Why a share is being re-evaluated. The settle delay gives the host time
/// to stabilize after the stimulus and coalesces bursts: a new event for
/// the same share supersedes the one still settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalEvent {
    HealthCheck,
    NetworkChange,
    VpnChange,
    SystemWake,
    UserInitiated,
    Startup,
}

impl EvalEvent {
    pub fn settle_delay(&self) -> Duration {
        match self {
            EvalEvent::HealthCheck => Duration::from_millis(100),
            EvalEvent::NetworkChange => Duration::from_secs(2),
            EvalEvent::VpnChange => Duration::from_secs(1),
            EvalEvent::SystemWake => Duration::from_secs(3),
            EvalEvent::UserInitiated => Duration::ZERO,
            EvalEvent::Startup => Duration::from_millis(500),
        }
    }
}

pub type EvalFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type EvalFn =
    Arc<dyn Fn(ShareId, EvalEvent, CancellationToken) -> EvalFuture + Send + Sync>;

struct Pending {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Schedules per-share evaluations.
///
/// Per share, at most one evaluation runs at a time (an async mutex
/// serializes them) and at most one is pending. A newly scheduled event
/// cancels the pending one — during its settle sleep or while it queues
/// for the run lock — but never the evaluation that is already running;
/// that one only observes its token at cooperative checkpoints.
pub struct Scheduler {
    evaluate: EvalFn,
    pending: Mutex<HashMap<ShareId, Pending>>,
    run_locks: Mutex<HashMap<ShareId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(evaluate: EvalFn) -> Arc<Self> {
        Arc::new(Self {
            evaluate,
            pending: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        })
    }

    /// The per-share serialization lock. Exposed so user-initiated
    /// operations can take the same queue position as evaluations.
    pub fn run_lock(&self, id: ShareId) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks.lock().unwrap().entry(id).or_default().clone()
    }

    pub fn schedule(self: &Arc<Self>, id: ShareId, event: EvalEvent) {
        // the latest event wins; whatever was pending is superseded
        self.cancel(id);

        let token = CancellationToken::new();
        let task_token = token.clone();
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let settle = event.settle_delay();
            if !settle.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(settle) => {}
                    _ = task_token.cancelled() => {
                        trace!(share = %id, ?event, "superseded while settling");
                        return;
                    }
                }
            }

            let lock = scheduler.run_lock(id);
            let guard = tokio::select! {
                guard = lock.lock() => guard,
                _ = task_token.cancelled() => {
                    trace!(share = %id, ?event, "superseded while queued");
                    return;
                }
            };

            (scheduler.evaluate)(id, event, task_token).await;
            drop(guard);
        });

        self.pending.lock().unwrap().insert(id, Pending { token, handle });
    }

    pub fn schedule_all(self: &Arc<Self>, ids: impl IntoIterator<Item = ShareId>, event: EvalEvent) {
        for id in ids {
            self.schedule(id, event);
        }
    }

    /// Drop pending work for a share. A running evaluation sees its token
    /// cancelled and exits at its next checkpoint.
    pub fn cancel(&self, id: ShareId) {
        if let Some(pending) = self.pending.lock().unwrap().remove(&id) {
            pending.token.cancel();
            // the task returns on its own; no abort, so a running
            // evaluation is never torn mid-transition
            drop(pending.handle);
        }
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, entry) in pending.drain() {
            entry.token.cancel();
        }
    }

    /// Forget a deleted share entirely.
    pub fn remove_share(&self, id: ShareId) {
        self.cancel(id);
        self.run_locks.lock().unwrap().remove(&id);
    }
}
