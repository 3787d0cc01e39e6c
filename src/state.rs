use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::config::ShareId;
use crate::error::MountError;

/// Health of a share that is attached in the kernel mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountHealth {
    Connected,
    /// Mount exists but the server is unreachable. Left alone until the
    /// server comes back; unmount/remount here causes thrashing during
    /// transient VPN drops.
    Degraded,
    Validating,
    Stale,
}

/// Per-share lifecycle state. Transitions are restricted to the edges in
/// [`transition_allowed`]; anything else is dropped, never panicked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareStatus {
    Unmounted,
    Mounting {
        attempt: u32,
        max_attempts: u32,
        last_error: Option<MountError>,
    },
    Mounted(MountHealth),
    Unmounting,
    Error(MountError),
    Disabled,
}

impl ShareStatus {
    pub fn is_mounted(&self) -> bool {
        matches!(self, ShareStatus::Mounted(_))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, ShareStatus::Mounting { .. } | ShareStatus::Unmounting)
    }

    /// True for states the health prober treats as "wants attention":
    /// they shorten the probe period and get re-scheduled for evaluation.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            ShareStatus::Unmounted
                | ShareStatus::Error(_)
                | ShareStatus::Mounted(MountHealth::Stale)
        )
    }
}

impl fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareStatus::Unmounted => write!(f, "Unmounted"),
            ShareStatus::Mounting { attempt, max_attempts, .. } => {
                write!(f, "Mounting ({}/{})", attempt, max_attempts)
            }
            ShareStatus::Mounted(MountHealth::Connected) => write!(f, "Connected"),
            ShareStatus::Mounted(MountHealth::Degraded) => write!(f, "Degraded"),
            ShareStatus::Mounted(MountHealth::Validating) => write!(f, "Validating"),
            ShareStatus::Mounted(MountHealth::Stale) => write!(f, "Stale"),
            ShareStatus::Unmounting => write!(f, "Unmounting"),
            ShareStatus::Error(e) => write!(f, "Error: {}", e),
            ShareStatus::Disabled => write!(f, "Disabled"),
        }
    }
}

/// The edge list. Mounted-to-Mounted covers health changes.
pub fn transition_allowed(from: &ShareStatus, to: &ShareStatus) -> bool {
    use ShareStatus::*;
    match (from, to) {
        (Unmounted, Mounting { .. }) | (Unmounted, Disabled) => true,
        (Mounting { .. }, Mounted(_))
        | (Mounting { .. }, Error(_))
        | (Mounting { .. }, Unmounted)
        | (Mounting { .. }, Disabled) => true,
        // covers attempt-counter updates within an episode
        (Mounting { .. }, Mounting { .. }) => true,
        (Mounted(_), Mounted(_))
        | (Mounted(_), Unmounting)
        | (Mounted(_), Error(_))
        | (Mounted(_), Disabled) => true,
        (Unmounting, Unmounted) | (Unmounting, Error(_)) => true,
        (Error(_), Mounting { .. }) | (Error(_), Unmounted) | (Error(_), Disabled) => true,
        (Disabled, Unmounted) | (Disabled, Mounting { .. }) => true,
        _ => false,
    }
}

/// Runtime record for one share, owned by the coordinator's state map.
#[derive(Debug, Clone)]
pub struct ShareState {
    pub status: ShareStatus,
    /// Attempt index within the present mounting episode; 0 when idle.
    pub attempt: u32,
    /// Wall-clock start of the current Mounting/Unmounting op. Set iff the
    /// status is one of those two; used for stuck-op detection.
    pub operation_start: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_success_at: Option<Instant>,
    /// Consecutive failed health probes. Informational for now.
    pub health_failures: u32,
    /// Auto-evaluation ignores the share until this passes (armed by a
    /// user-initiated disconnect).
    pub suspended_until: Option<Instant>,
}

impl Default for ShareState {
    fn default() -> Self {
        Self {
            status: ShareStatus::Unmounted,
            attempt: 0,
            operation_start: None,
            consecutive_failures: 0,
            last_success_at: None,
            health_failures: 0,
            suspended_until: None,
        }
    }
}

impl ShareState {
    /// Apply a transition if the edge exists; drop it (with a log line)
    /// otherwise. Returns whether the transition was taken.
    pub fn apply(&mut self, id: ShareId, to: ShareStatus) -> bool {
        if self.status == to {
            return true;
        }
        if !transition_allowed(&self.status, &to) {
            warn!(share = %id, from = %self.status, to = %to, "dropping forbidden state transition");
            return false;
        }

        match &to {
            ShareStatus::Mounting { attempt, .. } => {
                self.attempt = *attempt;
                if self.operation_start.is_none() {
                    self.operation_start = Some(Instant::now());
                }
            }
            ShareStatus::Unmounting => {
                self.operation_start = Some(Instant::now());
            }
            ShareStatus::Mounted(MountHealth::Connected) => {
                self.attempt = 0;
                self.operation_start = None;
                self.consecutive_failures = 0;
                self.health_failures = 0;
            }
            _ => {
                self.attempt = 0;
                self.operation_start = None;
            }
        }

        self.status = to;
        true
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_until.is_some_and(|until| Instant::now() < until)
    }
}

/// One snapshot row of the observer stream.
#[derive(Debug, Clone)]
pub struct ShareSnapshot {
    pub id: ShareId,
    pub status: ShareStatus,
    pub attempt: u32,
    pub consecutive_failures: u32,
}

impl ShareSnapshot {
    pub fn of(id: ShareId, state: &ShareState) -> Self {
        Self {
            id,
            status: state.status.clone(),
            attempt: state.attempt,
            consecutive_failures: state.consecutive_failures,
        }
    }
}
