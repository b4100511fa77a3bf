//! Fair cooperative primitives.
//!
//! Both primitives hand out grants from a FIFO queue through a [`DrainLoop`]:
//! at most one drain runs per primitive, and it yields to the runtime between
//! grants so other pending work gets a chance to enqueue.

mod drain;
mod semaphore;
mod turn;

pub(crate) use drain::{Drain, DrainLoop};
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use turn::TurnLock;

/// Default number of scheduler quanta yielded between two grants.
pub const DEFAULT_YIELDS: usize = 2;
