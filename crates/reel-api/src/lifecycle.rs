//! Process lifecycle state machine.
//!
//! Startup acquires resources in a fixed order and drain releases them in
//! the mirrored order:
//!
//! ```text
//! uninitialized → store_connected → broker_connected → admission_ready
//!   → queue_ready → workers_running → listening → draining → terminated
//! ```
//!
//! `draining` may be entered from any earlier state (a signal or fault can
//! arrive mid-startup); `terminated` only follows `draining`.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    StoreConnected,
    BrokerConnected,
    AdmissionReady,
    QueueReady,
    WorkersRunning,
    Listening,
    Draining,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::StoreConnected => "store_connected",
            LifecycleState::BrokerConnected => "broker_connected",
            LifecycleState::AdmissionReady => "admission_ready",
            LifecycleState::QueueReady => "queue_ready",
            LifecycleState::WorkersRunning => "workers_running",
            LifecycleState::Listening => "listening",
            LifecycleState::Draining => "draining",
            LifecycleState::Terminated => "terminated",
        }
    }

    /// The next startup step, if any.
    fn next_startup_step(&self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Uninitialized => Some(LifecycleState::StoreConnected),
            LifecycleState::StoreConnected => Some(LifecycleState::BrokerConnected),
            LifecycleState::BrokerConnected => Some(LifecycleState::AdmissionReady),
            LifecycleState::AdmissionReady => Some(LifecycleState::QueueReady),
            LifecycleState::QueueReady => Some(LifecycleState::WorkersRunning),
            LifecycleState::WorkersRunning => Some(LifecycleState::Listening),
            LifecycleState::Listening | LifecycleState::Draining | LifecycleState::Terminated => {
                None
            }
        }
    }

    pub fn can_advance_to(&self, next: LifecycleState) -> bool {
        match next {
            LifecycleState::Draining => *self < LifecycleState::Draining,
            LifecycleState::Terminated => *self == LifecycleState::Draining,
            step => self.next_startup_step() == Some(step),
        }
    }

    /// Accepting and serving traffic.
    pub fn is_ready(&self) -> bool {
        *self == LifecycleState::Listening
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Why the process started draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    Signal(&'static str),
    Panic(String),
    ListenerFailed(String),
}

impl DrainReason {
    /// Signals lead to a clean exit; faults do not.
    pub fn is_fault(&self) -> bool {
        !matches!(self, DrainReason::Signal(_))
    }
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainReason::Signal(name) => write!(f, "signal {}", name),
            DrainReason::Panic(msg) => write!(f, "panic: {}", msg),
            DrainReason::ListenerFailed(msg) => write!(f, "listener failed: {}", msg),
        }
    }
}

/// Observable lifecycle state.
#[derive(Clone)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Uninitialized);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Move to `to`, rejecting out-of-order transitions.
    pub fn advance(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_advance_to(to) {
                info!(from = %current, to = %to, "Lifecycle transition");
                *current = to;
                true
            } else {
                result = Err(LifecycleError { from: *current, to });
                false
            }
        });
        result
    }

    /// Enter `draining` unless already draining or terminated.
    ///
    /// Returns `true` for the caller that started the drain.
    pub fn begin_drain(&self) -> bool {
        self.advance(LifecycleState::Draining).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STARTUP: [LifecycleState; 6] = [
        LifecycleState::StoreConnected,
        LifecycleState::BrokerConnected,
        LifecycleState::AdmissionReady,
        LifecycleState::QueueReady,
        LifecycleState::WorkersRunning,
        LifecycleState::Listening,
    ];

    #[test]
    fn test_full_lifecycle() {
        let lifecycle = Lifecycle::new();
        for step in STARTUP {
            lifecycle.advance(step).unwrap();
        }
        assert!(lifecycle.state().is_ready());

        assert!(lifecycle.begin_drain());
        lifecycle.advance(LifecycleState::Terminated).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_steps_cannot_be_skipped() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.advance(LifecycleState::QueueReady).unwrap_err();
        assert_eq!(err.from, LifecycleState::Uninitialized);
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle.advance(LifecycleState::StoreConnected).unwrap();
        assert!(lifecycle.advance(LifecycleState::StoreConnected).is_err());
        assert!(lifecycle.advance(LifecycleState::Uninitialized).is_err());
    }

    #[test]
    fn test_drain_from_mid_startup() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::StoreConnected).unwrap();
        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert!(lifecycle.advance(LifecycleState::Listening).is_err());
    }

    #[test]
    fn test_terminated_requires_draining() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(LifecycleState::Terminated).is_err());
    }

    #[tokio::test]
    async fn test_state_is_observable() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();
        lifecycle.advance(LifecycleState::StoreConnected).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::StoreConnected);
    }

    #[test]
    fn test_drain_reason() {
        assert!(!DrainReason::Signal("SIGTERM").is_fault());
        assert!(DrainReason::Panic("boom".into()).is_fault());
        assert_eq!(DrainReason::Signal("SIGINT").to_string(), "signal SIGINT");
    }
}
