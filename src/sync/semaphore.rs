use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::core::lock;
use crate::sync::{DEFAULT_YIELDS, Drain, DrainLoop};

/// Counting semaphore with strict FIFO grants.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    limit: usize,
    yields: usize,
    state: Mutex<SemaphoreState>,
    drain: DrainLoop,
}

#[derive(Default)]
struct SemaphoreState {
    count: usize,
    queue: VecDeque<oneshot::Sender<SemaphoreGuard>>,
}

impl Semaphore {
    pub fn new(limit: usize) -> Self {
        Self::with_yields(limit, DEFAULT_YIELDS)
    }

    pub fn with_yields(limit: usize, yields: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                limit,
                yields,
                state: Mutex::new(SemaphoreState::default()),
                drain: DrainLoop::default(),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Number of guards currently held.
    pub fn count(&self) -> usize {
        lock(&self.inner.state).count
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.count())
    }

    /// Waits in line for a slot.
    pub async fn lock(&self) -> SemaphoreGuard {
        loop {
            let (waiter, granted) = oneshot::channel();
            lock(&self.inner.state).queue.push_back(waiter);
            DrainLoop::trigger(&self.inner);

            // A waiter leaves the queue only through a grant, so a closed
            // channel just means taking a place in line again.
            if let Ok(guard) = granted.await {
                return guard;
            }
        }
    }
}

impl Drain for SemaphoreInner {
    fn drain_loop(&self) -> &DrainLoop {
        &self.drain
    }

    fn yields(&self) -> usize {
        self.yields
    }

    fn can_grant(&self) -> bool {
        let state = lock(&self.state);
        state.count < self.limit && !state.queue.is_empty()
    }

    fn grant_next(owner: &Arc<Self>) -> bool {
        let waiter = {
            let mut state = lock(&owner.state);
            if state.count >= owner.limit {
                return false;
            }
            let Some(waiter) = state.queue.pop_front() else {
                return false;
            };
            state.count += 1;
            waiter
        };

        let guard = SemaphoreGuard {
            semaphore: Arc::clone(owner),
            released: AtomicBool::new(false),
        };

        // A waiter that gave up hands the guard back, dropping it frees the
        // slot again.
        if waiter.send(guard).is_ok() {
            tracing::trace!(limit = owner.limit, "semaphore granted");
        }

        true
    }
}

/// A held semaphore slot.
///
/// Releasing is idempotent: only the first call frees the slot. Dropping the
/// guard releases it as well.
pub struct SemaphoreGuard {
    semaphore: Arc<SemaphoreInner>,
    released: AtomicBool,
}

impl SemaphoreGuard {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut state = lock(&self.semaphore.state);
            state.count = state.count.saturating_sub(1);
        }

        DrainLoop::trigger(&self.semaphore);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SemaphoreGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreGuard")
            .field("released", &self.is_released())
            .finish()
    }
}
