//! Backpressure gates bounding in-flight physical requests.
//!
//! A permit is acquired before a physical fetch is submitted and released
//! when the returned guard is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Shared limiter consulted by every physical query function.
#[async_trait]
pub trait QueryBackPressure: Send + Sync + 'static {
    /// Wait for a permit. Fails when the limiter has been closed.
    async fn acquire(&self) -> anyhow::Result<QueryPermit>;

    /// Stop handing out permits. Outstanding permits stay valid.
    fn close(&self) {}
}

/// Guard that releases a backpressure permit on drop.
pub struct QueryPermit {
    guard: Option<Box<dyn Send + Sync>>,
}

impl QueryPermit {
    /// Permit with nothing to release.
    pub fn noop() -> Self {
        Self { guard: None }
    }

    /// Permit releasing `guard` when dropped.
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            guard: Some(Box::new(guard)),
        }
    }
}

impl std::fmt::Debug for QueryPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPermit")
            .field("noop", &self.guard.is_none())
            .finish()
    }
}

/// Never limits.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassAllBackPressure;

#[async_trait]
impl QueryBackPressure for PassAllBackPressure {
    async fn acquire(&self) -> anyhow::Result<QueryPermit> {
        Ok(QueryPermit::noop())
    }
}

/// Fixed number of concurrent physical requests.
#[derive(Debug)]
pub struct SemaphoreBackPressure {
    semaphore: Arc<Semaphore>,
}

impl SemaphoreBackPressure {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[async_trait]
impl QueryBackPressure for SemaphoreBackPressure {
    async fn acquire(&self) -> anyhow::Result<QueryPermit> {
        let permit: OwnedSemaphorePermit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("query backpressure semaphore is closed"))?;
        Ok(QueryPermit::new(permit))
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// Limiter whose in-flight cap can be adjusted at runtime within `[min, max]`.
#[derive(Debug)]
pub struct InflightBackPressure {
    inner: Arc<InflightState>,
}

#[derive(Debug)]
struct InflightState {
    limit: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    min: usize,
    max: usize,
}

impl InflightBackPressure {
    /// Create a limiter with an initial limit clamped within min/max.
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let initial = initial.clamp(min, max);
        Self {
            inner: Arc::new(InflightState {
                limit: AtomicUsize::new(initial),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                min,
                max,
            }),
        }
    }

    /// Current in-flight limit.
    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Relaxed)
    }

    /// Requests currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    /// Change the limit, clamped to min/max. Returns true when it changed.
    pub fn adjust(&self, desired: usize) -> bool {
        let desired = desired.clamp(self.inner.min, self.inner.max);
        let prev = self.inner.limit.swap(desired, Ordering::Relaxed);
        if desired != prev {
            self.inner.notify.notify_waiters();
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl QueryBackPressure for InflightBackPressure {
    async fn acquire(&self) -> anyhow::Result<QueryPermit> {
        let state = &self.inner;
        loop {
            // Register interest before checking so a release between the
            // check and the await is not lost.
            let notified = state.notify.notified();
            if state.closed.load(Ordering::Acquire) {
                return Err(anyhow!("query backpressure limiter is closed"));
            }
            let limit = state.limit.load(Ordering::Relaxed).max(1);
            let current = state.in_flight.load(Ordering::Relaxed);
            if current < limit {
                if state
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(QueryPermit::new(InflightPermit {
                        state: state.clone(),
                    }));
                }
                continue;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }
}

struct InflightPermit {
    state: Arc<InflightState>,
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.state.notify.notify_one();
    }
}
