//! Cancellation framework: CancellationToken + generation guard.
//! Scheduled callbacks (circuit-breaker reset timers) check their guard before
//! mutating shared state, so a timer that was superseded or cancelled is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Manages generations for one replaceable scheduled task. Arming a new
/// generation cancels every token issued for the previous one.
pub struct TaskGeneration {
    current_token: RwLock<CancellationToken>,
    generation: Arc<AtomicU64>,
}

impl TaskGeneration {
    /// New generation tracker whose tokens are children of `parent`,
    /// so cancelling the parent cancels everything issued here.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            current_token: RwLock::new(parent.child_token()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cancel the current generation, advance, and hand out a guard for the new one.
    pub fn cancel_and_advance(&self, parent: &CancellationToken) -> GenerationGuard {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        let new_token = parent.child_token();
        *token_guard = new_token.clone();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationGuard::new(Arc::clone(&self.generation), gen, new_token)
    }

    /// Cancel the current generation without issuing a new guard.
    pub fn cancel(&self) {
        self.current_token.read().cancel();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Guard a scheduled task checks before applying its effect.
/// If the generation has advanced past `my_generation`, the task is stale.
#[derive(Clone)]
pub struct GenerationGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl GenerationGuard {
    pub fn new(generation: Arc<AtomicU64>, my_generation: u64, token: CancellationToken) -> Self {
        Self {
            generation,
            my_generation,
            token,
        }
    }

    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not cancelled and still current.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}
