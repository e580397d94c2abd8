//! Per-layer circuit breaker.
//!
//! closed → open once `total ≥ min_requests` and `errors/total ≥ error_threshold`.
//! open → halfOpen from a reset timer after `reset_timeout`, independent of traffic.
//! halfOpen → closed after `success_threshold` consecutive successes; any error
//! in halfOpen reopens the circuit and re-arms the timer.
//! Counters are halved on the next event once `window` has passed without an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::{GenerationGuard, TaskGeneration};
use crate::config::HealthSection;
use crate::layer::LayerType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "halfOpen",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub error_threshold: f64,
    pub min_requests: u64,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    pub window: Duration,
}

impl From<&HealthSection> for HealthThresholds {
    fn from(section: &HealthSection) -> Self {
        Self {
            error_threshold: section.error_threshold,
            min_requests: section.min_requests,
            reset_timeout: Duration::from_secs(section.reset_timeout_seconds),
            success_threshold: section.success_threshold,
            window: Duration::from_secs(section.window_seconds),
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthSection::default())
    }
}

/// Live breaker state for one layer type.
#[derive(Debug, Clone)]
struct LayerHealth {
    state: CircuitState,
    total_requests: u64,
    error_count: u64,
    consecutive_successes: u32,
    last_error: Option<String>,
    last_error_at: Option<Instant>,
    opened_at: Option<Instant>,
    // last error, last decay, or creation
    quiet_since: Instant,
}

impl LayerHealth {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            total_requests: 0,
            error_count: 0,
            consecutive_successes: 0,
            last_error: None,
            last_error_at: None,
            opened_at: None,
            quiet_since: now,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_requests as f64
        }
    }

    fn decay(&mut self, now: Instant, window: Duration) -> bool {
        if self.state != CircuitState::Closed
            || now.saturating_duration_since(self.quiet_since) < window
        {
            return false;
        }
        self.total_requests /= 2;
        self.error_count /= 2;
        self.quiet_since = now;
        true
    }

    fn close(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.total_requests = 0;
        self.error_count = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.quiet_since = now;
    }
}

/// Reporting view of a layer's breaker.
#[derive(Debug, Clone, Serialize)]
pub struct LayerHealthSnapshot {
    pub layer_type: LayerType,
    pub state: CircuitState,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub ms_since_last_error: Option<u64>,
    pub ms_since_opened: Option<u64>,
}

pub struct LayerHealthMonitor {
    enabled: bool,
    thresholds: RwLock<HealthThresholds>,
    layers: Mutex<HashMap<LayerType, LayerHealth>>,
    timers: Mutex<HashMap<LayerType, Arc<TaskGeneration>>>,
    root: CancellationToken,
    runtime: Option<Handle>,
    disposed: AtomicBool,
    self_ref: Weak<LayerHealthMonitor>,
}

impl LayerHealthMonitor {
    /// Reset timers run on the current tokio runtime. Outside a runtime the
    /// open → halfOpen transition is evaluated when the state is read.
    pub fn new(enabled: bool, thresholds: HealthThresholds) -> Arc<Self> {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("health monitor created outside a tokio runtime; reset timers are lazy");
        }
        Arc::new_cyclic(|self_ref| Self {
            enabled,
            thresholds: RwLock::new(thresholds),
            layers: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
            runtime,
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn from_config(section: &HealthSection) -> Arc<Self> {
        Self::new(section.enabled, HealthThresholds::from(section))
    }

    pub fn configure(&self, thresholds: HealthThresholds) {
        *self.thresholds.write() = thresholds;
    }

    fn active(&self) -> bool {
        self.enabled && !self.disposed.load(Ordering::Acquire)
    }

    pub fn record_success(&self, layer: LayerType) {
        if !self.active() {
            return;
        }
        let thresholds = *self.thresholds.read();
        let now = Instant::now();
        let mut layers = self.layers.lock();
        let health = layers.entry(layer).or_insert_with(|| LayerHealth::new(now));
        self.lazy_half_open(layer, health, now, &thresholds);
        if health.decay(now, thresholds.window) {
            debug!(layer = %layer, total = health.total_requests, "health_counters_decayed");
        }
        health.total_requests += 1;

        if health.state == CircuitState::HalfOpen {
            health.consecutive_successes += 1;
            if health.consecutive_successes >= thresholds.success_threshold {
                health.close(now);
                info!(layer = %layer, from = "halfOpen", to = "closed", "circuit_transition");
            }
        }
    }

    pub fn record_error(&self, layer: LayerType, message: &str) {
        if !self.active() {
            return;
        }
        let thresholds = *self.thresholds.read();
        let now = Instant::now();
        let mut layers = self.layers.lock();
        let health = layers.entry(layer).or_insert_with(|| LayerHealth::new(now));
        self.lazy_half_open(layer, health, now, &thresholds);
        health.decay(now, thresholds.window);
        health.total_requests += 1;
        health.error_count += 1;
        health.last_error = Some(message.to_string());
        health.last_error_at = Some(now);
        health.quiet_since = now;

        match health.state {
            CircuitState::HalfOpen => {
                health.consecutive_successes = 0;
                self.open(layer, health, now, &thresholds);
                info!(layer = %layer, from = "halfOpen", to = "open", "circuit_transition");
            }
            CircuitState::Closed => {
                if health.total_requests >= thresholds.min_requests
                    && health.error_rate() >= thresholds.error_threshold
                {
                    let error_rate = health.error_rate();
                    self.open(layer, health, now, &thresholds);
                    warn!(
                        layer = %layer,
                        error_rate,
                        total = health.total_requests,
                        "circuit_opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_open(&self, layer: LayerType) -> bool {
        self.state(layer) == CircuitState::Open
    }

    pub fn state(&self, layer: LayerType) -> CircuitState {
        if !self.active() {
            return CircuitState::Closed;
        }
        let thresholds = *self.thresholds.read();
        let mut layers = self.layers.lock();
        match layers.get_mut(&layer) {
            Some(health) => {
                self.lazy_half_open(layer, health, Instant::now(), &thresholds);
                health.state
            }
            None => CircuitState::Closed,
        }
    }

    /// Administrative override: cancel any reset timer and close with fresh counters.
    pub fn force_close_circuit(&self, layer: LayerType) {
        let now = Instant::now();
        let mut layers = self.layers.lock();
        if let Some(timer) = self.timers.lock().get(&layer) {
            timer.cancel();
        }
        let health = layers.entry(layer).or_insert_with(|| LayerHealth::new(now));
        let from = health.state;
        health.close(now);
        health.last_error = None;
        health.last_error_at = None;
        info!(layer = %layer, from = %from, to = "closed", "circuit_force_closed");
    }

    pub fn snapshot(&self, layer: LayerType) -> Option<LayerHealthSnapshot> {
        let thresholds = *self.thresholds.read();
        let now = Instant::now();
        let mut layers = self.layers.lock();
        let health = layers.get_mut(&layer)?;
        self.lazy_half_open(layer, health, now, &thresholds);
        Some(snapshot_of(layer, health, now))
    }

    /// Every tracked layer, in pipeline order.
    pub fn all(&self) -> Vec<LayerHealthSnapshot> {
        LayerType::ALL
            .iter()
            .filter_map(|layer| self.snapshot(*layer))
            .collect()
    }

    /// Cancel all timers and stop recording. Irreversible.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.root.cancel();
        self.timers.lock().clear();
        debug!("health monitor disposed");
    }

    fn open(
        &self,
        layer: LayerType,
        health: &mut LayerHealth,
        now: Instant,
        thresholds: &HealthThresholds,
    ) {
        health.state = CircuitState::Open;
        health.opened_at = Some(now);
        health.consecutive_successes = 0;
        self.arm_reset_timer(layer, thresholds.reset_timeout);
    }

    /// Schedule open → halfOpen. Re-arming supersedes the previous timer.
    fn arm_reset_timer(&self, layer: LayerType, after: Duration) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let generation = self
            .timers
            .lock()
            .entry(layer)
            .or_insert_with(|| Arc::new(TaskGeneration::new(&self.root)))
            .clone();
        let guard = generation.cancel_and_advance(&self.root);
        let monitor = self.self_ref.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = guard.token().cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if let Some(monitor) = monitor.upgrade() {
                        monitor.timer_fired(layer, &guard);
                    }
                }
            }
        });
    }

    fn timer_fired(&self, layer: LayerType, guard: &GenerationGuard) {
        let mut layers = self.layers.lock();
        // checked under the lock: force-close cancels while holding it
        if !guard.should_continue() {
            return;
        }
        if let Some(health) = layers.get_mut(&layer) {
            if health.state == CircuitState::Open {
                health.state = CircuitState::HalfOpen;
                health.consecutive_successes = 0;
                info!(layer = %layer, from = "open", to = "halfOpen", "circuit_transition");
            }
        }
    }

    fn lazy_half_open(
        &self,
        layer: LayerType,
        health: &mut LayerHealth,
        now: Instant,
        thresholds: &HealthThresholds,
    ) {
        if self.runtime.is_some() || health.state != CircuitState::Open {
            return;
        }
        let elapsed = health
            .opened_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if elapsed >= thresholds.reset_timeout {
            health.state = CircuitState::HalfOpen;
            health.consecutive_successes = 0;
            info!(layer = %layer, from = "open", to = "halfOpen", "circuit_transition");
        }
    }
}

fn snapshot_of(layer: LayerType, health: &LayerHealth, now: Instant) -> LayerHealthSnapshot {
    let since = |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_millis() as u64);
    LayerHealthSnapshot {
        layer_type: layer,
        state: health.state,
        total_requests: health.total_requests,
        error_count: health.error_count,
        error_rate: health.error_rate(),
        consecutive_successes: health.consecutive_successes,
        last_error: health.last_error.clone(),
        ms_since_last_error: since(health.last_error_at),
        ms_since_opened: since(health.opened_at),
    }
}

impl Drop for LayerHealthMonitor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            error_threshold: 0.5,
            min_requests: 10,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
            window: Duration::from_secs(300),
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn trip(monitor: &LayerHealthMonitor, layer: LayerType) {
        for _ in 0..5 {
            monitor.record_success(layer);
        }
        for _ in 0..5 {
            monitor.record_error(layer, "boom");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_breaker_cycle() {
        let monitor = LayerHealthMonitor::new(true, thresholds());
        let layer = LayerType::Dictionary;

        for _ in 0..5 {
            monitor.record_success(layer);
        }
        for _ in 0..4 {
            monitor.record_error(layer, "boom");
        }
        assert_eq!(monitor.state(layer), CircuitState::Closed);
        monitor.record_error(layer, "boom");
        assert_eq!(monitor.state(layer), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(monitor.state(layer), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(monitor.state(layer), CircuitState::HalfOpen);

        monitor.record_success(layer);
        monitor.record_success(layer);
        assert_eq!(monitor.state(layer), CircuitState::HalfOpen);
        monitor.record_success(layer);
        assert_eq!(monitor.state(layer), CircuitState::Closed);
        let snap = monitor.snapshot(layer).unwrap();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_in_half_open_reopens() {
        let monitor = LayerHealthMonitor::new(true, thresholds());
        let layer = LayerType::Grammar;
        trip(&monitor, layer);
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(monitor.state(layer), CircuitState::HalfOpen);

        monitor.record_success(layer);
        monitor.record_error(layer, "again");
        assert_eq!(monitor.state(layer), CircuitState::Open);
        assert_eq!(monitor.snapshot(layer).unwrap().consecutive_successes, 0);

        // the re-armed timer restores halfOpen again
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(monitor.state(layer), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn below_min_requests_never_opens() {
        let monitor = LayerHealthMonitor::new(true, thresholds());
        for _ in 0..9 {
            monitor.record_error(LayerType::WordOrder, "boom");
        }
        assert_eq!(monitor.state(LayerType::WordOrder), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_cancels_pending_timer() {
        let monitor = LayerHealthMonitor::new(true, thresholds());
        let layer = LayerType::PhraseLookup;
        trip(&monitor, layer);
        monitor.force_close_circuit(layer);
        assert_eq!(monitor.state(layer), CircuitState::Closed);

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(monitor.state(layer), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_halve_after_quiet_window() {
        let monitor = LayerHealthMonitor::new(true, thresholds());
        let layer = LayerType::PostProcessing;
        for _ in 0..4 {
            monitor.record_error(layer, "boom");
        }
        for _ in 0..4 {
            monitor.record_success(layer);
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        monitor.record_success(layer);
        let snap = monitor.snapshot(layer).unwrap();
        assert_eq!(snap.error_count, 2);
        assert_eq!(snap.total_requests, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_or_disposed_monitor_stays_closed() {
        let disabled = LayerHealthMonitor::new(false, thresholds());
        trip(&disabled, LayerType::Dictionary);
        assert!(!disabled.is_open(LayerType::Dictionary));

        let monitor = LayerHealthMonitor::new(true, thresholds());
        trip(&monitor, LayerType::Dictionary);
        assert!(monitor.is_open(LayerType::Dictionary));
        monitor.dispose();
        assert!(!monitor.is_open(LayerType::Dictionary));
    }

    #[test]
    fn lazy_reset_without_runtime() {
        let monitor = LayerHealthMonitor::new(
            true,
            HealthThresholds {
                reset_timeout: Duration::ZERO,
                ..thresholds()
            },
        );
        trip(&monitor, LayerType::Dictionary);
        assert_eq!(monitor.state(LayerType::Dictionary), CircuitState::HalfOpen);
    }
}
