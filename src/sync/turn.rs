use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::core::lock;
use crate::sync::{DEFAULT_YIELDS, Drain, DrainLoop};

/// FIFO fairness lock serializing scheduling turns.
///
/// There is no release: being granted a ticket is the signal to proceed, and
/// the holder's next critical section has to [`acquire`](Self::acquire) again.
/// Tickets are granted strictly in the order they were enqueued.
#[derive(Clone)]
pub struct TurnLock {
    inner: Arc<TurnInner>,
}

struct TurnInner {
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
    drain: DrainLoop,
    yields: usize,
}

impl TurnLock {
    pub fn new(yields: usize) -> Self {
        Self {
            inner: Arc::new(TurnInner {
                queue: Mutex::new(VecDeque::new()),
                drain: DrainLoop::default(),
                yields,
            }),
        }
    }

    /// Waits for this caller's turn.
    pub async fn acquire(&self) {
        let (ticket, granted) = oneshot::channel();
        lock(&self.inner.queue).push_back(ticket);
        DrainLoop::trigger(&self.inner);

        // The ticket stays queued until it is granted, and `self` keeps the
        // queue alive, so the sender is never dropped unsent.
        let _ = granted.await;
    }

    /// Number of tickets still waiting for their turn.
    pub fn waiting(&self) -> usize {
        lock(&self.inner.queue).len()
    }
}

impl Default for TurnLock {
    fn default() -> Self {
        Self::new(DEFAULT_YIELDS)
    }
}

impl Drain for TurnInner {
    fn drain_loop(&self) -> &DrainLoop {
        &self.drain
    }

    fn yields(&self) -> usize {
        self.yields
    }

    fn can_grant(&self) -> bool {
        !lock(&self.queue).is_empty()
    }

    fn grant_next(owner: &Arc<Self>) -> bool {
        let ticket = lock(&owner.queue).pop_front();
        match ticket {
            Some(ticket) => {
                // A caller that gave up waiting simply forfeits its turn.
                let _ = ticket.send(());
                tracing::trace!("turn granted");
                true
            }
            None => false,
        }
    }
}
