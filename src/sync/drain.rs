use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Re-entrancy flag of a single-owner drain loop.
#[derive(Default)]
pub(crate) struct DrainLoop {
    running: AtomicBool,
}

/// A queue drained by at most one loop at a time.
pub(crate) trait Drain: Send + Sync + 'static {
    fn drain_loop(&self) -> &DrainLoop;

    /// Scheduler quanta to yield after each grant.
    fn yields(&self) -> usize;

    /// Whether `grant_next` would grant someone right now.
    fn can_grant(&self) -> bool;

    /// Grants the oldest waiter, if the queue and limits allow it.
    fn grant_next(owner: &Arc<Self>) -> bool
    where
        Self: Sized;
}

impl DrainLoop {
    /// Starts the drain loop for `owner` unless one is already running.
    ///
    /// On a tokio runtime the loop is spawned and yields between grants.
    /// Without one, every grantable waiter is granted inline before this
    /// returns.
    pub(crate) fn trigger<D: Drain>(owner: &Arc<D>) {
        if owner.drain_loop().running.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            loop {
                while D::grant_next(owner) {}
                if !Self::resume(owner) {
                    break;
                }
            }
            return;
        };

        let owner = Arc::clone(owner);
        runtime.spawn(async move {
            loop {
                while D::grant_next(&owner) {
                    for _ in 0..owner.yields() {
                        tokio::task::yield_now().await;
                    }
                }

                if !Self::resume(&owner) {
                    break;
                }
            }
        });
    }

    /// Clears the running flag. Returns true when work arrived in the
    /// meantime and the caller has taken the flag back to drain it.
    fn resume<D: Drain>(owner: &Arc<D>) -> bool {
        owner.drain_loop().running.store(false, Ordering::Release);

        // A trigger that fired between the last grant and the store above
        // saw `running` set and left the work to us.
        owner.can_grant() && !owner.drain_loop().running.swap(true, Ordering::AcqRel)
    }
}
