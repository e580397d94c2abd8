//! Engine lifecycle: Uninitialized → Initializing → Ready ⇄ Processing → Disposing → Disposed.
//! Error is transient: a caught internal failure parks the engine there until the
//! request finishes or `reset()` forces it back to Ready.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::EngineError;

/// All possible states in the engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    Processing,
    Error,
    Disposing,
    Disposed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "Uninitialized"),
            EngineState::Initializing => write!(f, "Initializing"),
            EngineState::Ready => write!(f, "Ready"),
            EngineState::Processing => write!(f, "Processing"),
            EngineState::Error => write!(f, "Error"),
            EngineState::Disposing => write!(f, "Disposing"),
            EngineState::Disposed => write!(f, "Disposed"),
        }
    }
}

impl EngineState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::Uninitialized, EngineState::Initializing)
                | (EngineState::Initializing, EngineState::Ready)
                | (EngineState::Initializing, EngineState::Error)
                | (EngineState::Ready, EngineState::Processing)
                | (EngineState::Processing, EngineState::Ready)
                | (EngineState::Processing, EngineState::Error)
                | (EngineState::Error, EngineState::Ready)
                | (EngineState::Ready, EngineState::Disposing)
                | (EngineState::Processing, EngineState::Disposing)
                | (EngineState::Error, EngineState::Disposing)
                | (EngineState::Uninitialized, EngineState::Disposing)
                | (EngineState::Disposing, EngineState::Disposed)
        )
    }

    /// Ready or Processing: requests may be queued.
    pub fn accepts_requests(self) -> bool {
        matches!(self, EngineState::Ready | EngineState::Processing)
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, EngineState::Disposing | EngineState::Disposed)
    }
}

/// Thread-safe state machine with a watch channel for subscribers.
/// The channel is closed when the engine is disposed.
pub struct StateMachine {
    state: RwLock<EngineState>,
    state_tx: Mutex<Option<watch::Sender<EngineState>>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);
        Self {
            state: RwLock::new(EngineState::Uninitialized),
            state_tx: Mutex::new(Some(state_tx)),
        }
    }

    /// Current state (non-blocking read).
    pub fn current(&self) -> EngineState {
        *self.state.read()
    }

    /// Attempt a validated state transition.
    pub fn transition(&self, next: EngineState) -> Result<EngineState, EngineError> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "invalid state transition");
            return Err(EngineError::InvalidState {
                state: current,
                operation: "transition",
            });
        }
        *state = next;
        self.publish(next);
        info!(from = %current, to = %next, "state_transition");
        Ok(next)
    }

    /// Move to `next` only if the engine is not shutting down. Used when a
    /// request finishes: a concurrent `dispose()` wins.
    pub fn settle(&self, next: EngineState) -> bool {
        let mut state = self.state.write();
        let current = *state;
        if current.is_shutting_down() || current == next || !current.can_transition_to(next) {
            return false;
        }
        *state = next;
        self.publish(next);
        tracing::debug!(from = %current, to = %next, "state_settled");
        true
    }

    /// Force Ready from any live state (used by `reset()`).
    pub fn force_ready(&self) -> Result<(), EngineError> {
        let mut state = self.state.write();
        let prev = *state;
        if prev.is_shutting_down() {
            return Err(EngineError::Disposed);
        }
        if prev == EngineState::Uninitialized {
            return Err(EngineError::InvalidState {
                state: prev,
                operation: "reset",
            });
        }
        *state = EngineState::Ready;
        self.publish(EngineState::Ready);
        info!(from = %prev, "force_ready");
        Ok(())
    }

    /// Subscribe to state changes. Returns None once the channel is closed.
    pub fn subscribe(&self) -> Option<watch::Receiver<EngineState>> {
        self.state_tx.lock().as_ref().map(|tx| tx.subscribe())
    }

    /// Drop the sender so every subscriber observes a closed channel.
    pub fn close(&self) {
        self.state_tx.lock().take();
    }

    fn publish(&self, next: EngineState) {
        if let Some(tx) = self.state_tx.lock().as_ref() {
            tx.send_replace(next);
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
