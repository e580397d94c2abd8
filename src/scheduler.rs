//! Request admission and the single serialized execution slot.
//! - `AdmissionControl`: pending-request counter checked before queuing, so
//!   overflow is rejected immediately instead of waiting.
//! - `RateLimiter`: minimum interval between requests entering the slot.
//! - `SerialExecutor`: one tokio worker draining an unbounded FIFO channel;
//!   exactly one job body runs at a time, in submission order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::metrics::{metric_names, MetricsRegistry};

/// Pending-request counter with an optional ceiling (0 = unlimited).
#[derive(Debug, Default)]
pub struct AdmissionControl {
    pending: AtomicUsize,
    max_pending: AtomicUsize,
}

impl AdmissionControl {
    pub fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(0),
            max_pending: AtomicUsize::new(max_pending),
        })
    }

    /// Count this request in; `None` if that would exceed the ceiling.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let max = self.max_pending.load(Ordering::Acquire);
        if max > 0 && pending > max {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(pending = pending - 1, max_pending = max, "admission_rejected");
            return None;
        }
        Some(AdmissionPermit {
            control: Arc::clone(self),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending.load(Ordering::Acquire)
    }

    pub fn set_max_pending(&self, max_pending: usize) {
        self.max_pending.store(max_pending, Ordering::Release);
    }
}

/// Releases its slot in the pending counter on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    control: Arc<AdmissionControl>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.control.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spaces requests at least `60s / max_requests_per_minute` apart.
/// Waits, never rejects.
pub struct RateLimiter {
    next_allowed: tokio::sync::Mutex<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn per_minute(max_requests_per_minute: u32) -> Self {
        let per_minute = max_requests_per_minute.max(1);
        Self {
            next_allowed: tokio::sync::Mutex::new(Instant::now()),
            min_interval: Duration::from_secs(60) / per_minute,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep until the next slot is free and claim it. Returns the time waited.
    pub async fn wait(&self) -> Duration {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        let waited = if *next > now {
            let delay = *next - now;
            tokio::time::sleep(delay).await;
            delay
        } else {
            Duration::ZERO
        };
        *next = Instant::now() + self.min_interval;
        waited
    }
}

struct Envelope {
    job: BoxFuture<'static, ()>,
    enqueued_at: Instant,
}

/// FIFO single-slot executor.
pub struct SerialExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    running: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
}

impl SerialExecutor {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(metrics: Arc<MetricsRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(worker_loop(rx, metrics, running.clone(), queued.clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            running,
            queued,
        }
    }

    /// Queue `job`; the receiver resolves with its output once it has run.
    pub fn submit<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>, EngineError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped = async move {
            let out = job.await;
            // the caller may have timed out and dropped the receiver
            let _ = reply_tx.send(out);
        }
        .boxed();

        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(EngineError::Disposed)?;
        self.queued.fetch_add(1, Ordering::AcqRel);
        tx.send(Envelope {
            job: wrapped,
            enqueued_at: Instant::now(),
        })
        .map_err(|_| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            EngineError::Internal("serial executor stopped".into())
        })?;
        Ok(reply_rx)
    }

    /// Jobs submitted but not yet finished.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and wait until every job queued so far has run.
    pub async fn drain(&self) {
        let barrier = self.submit(async {}).ok();
        self.shutdown();
        if let Some(barrier) = barrier {
            let _ = barrier.await;
        }
    }

    /// Stop accepting jobs. Jobs already queued still run.
    pub fn shutdown(&self) {
        if self.tx.lock().take().is_some() {
            info!("serial executor shutting down");
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    metrics: Arc<MetricsRegistry>,
    running: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
) {
    info!("serial worker loop started");
    while let Some(envelope) = rx.recv().await {
        let wait_us = envelope.enqueued_at.elapsed().as_micros() as f64;
        metrics.record(metric_names::QUEUE_WAIT, wait_us);
        if AssertUnwindSafe(envelope.job).catch_unwind().await.is_err() {
            error!("serialized job panicked");
        }
        queued.fetch_sub(1, Ordering::AcqRel);
    }
    running.store(false, Ordering::Release);
    info!("serial worker loop exiting (channel closed)");
}
