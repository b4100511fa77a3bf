use std::fmt::{Debug, Formatter};
use std::sync::{Arc, LazyLock, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};

use crate::core::lock;
use crate::engine::{Cx, Engine};
use crate::engine::context::ContextId;
use crate::error::EngineError;
use crate::sync::SemaphoreGuard;
use crate::task::{Job, Task, TaskOptions};
use crate::value::Value;

/// Something held for as long as a job runs, released once the job's
/// outcome settles.
pub trait Guard: Send + Sync {
    fn release(&self) -> BoxFuture<'_, ()>;
}

impl Guard for SemaphoreGuard {
    fn release(&self) -> BoxFuture<'_, ()> {
        SemaphoreGuard::release(self);
        futures::future::ready(()).boxed()
    }
}

/// A guard backed by a closure, called at most once.
pub struct FnGuard(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl FnGuard {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Mutex::new(Some(Box::new(release))))
    }
}

impl Guard for FnGuard {
    fn release(&self) -> BoxFuture<'_, ()> {
        let release = lock(&self.0).take();
        if let Some(release) = release {
            release();
        }
        futures::future::ready(()).boxed()
    }
}

impl Debug for FnGuard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGuard")
            .field("released", &lock(&self.0).is_none())
            .finish()
    }
}

impl Cx {
    /// Registers `guard` with the nearest enclosing job that holds a guard
    /// set, or opens a set on the current job if none does.
    pub fn add_guard(&self, guard: impl Guard + 'static) -> Result<(), EngineError> {
        let current = self.context.ok_or(EngineError::Detached)?;
        let mut state = lock(&self.engine.inner.state);

        let owner = state.guard_owner(current).unwrap_or(current);
        state
            .context_mut(owner)
            .guards
            .get_or_insert_with(Vec::new)
            .push(Arc::new(guard));
        Ok(())
    }

    /// Opens an empty guard set on the current job, so guards registered by
    /// anything it runs are held until it settles.
    pub fn open_guard_scope(&self) -> Result<(), EngineError> {
        let current = self.context.ok_or(EngineError::Detached)?;
        lock(&self.engine.inner.state)
            .context_mut(current)
            .guards
            .get_or_insert_with(Vec::new);
        Ok(())
    }
}

impl Engine {
    /// Releases every guard registered on `id`, concurrently.
    pub(crate) async fn release_guards(&self, id: ContextId) {
        let guards = lock(&self.inner.state).take_guards(id);
        if guards.is_empty() {
            return;
        }

        tracing::trace!(count = guards.len(), "releasing guards");
        join_all(guards.iter().map(|guard| guard.release())).await;
    }
}

static GUARD_SCOPE: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, mut input: Vec<Value>| async move {
            cx.open_guard_scope()?;
            anyhow::Ok(input.pop().unwrap_or(Value::Void))
        },
        TaskOptions::new()
            .name("guardScope")
            .derive_input(|_, input| async move { anyhow::Ok(input) }),
    )
});

/// Runs `job` in a scope that holds the guards registered beneath it until
/// the scope settles.
pub fn guard_scope(job: impl Into<Value>) -> Job {
    GUARD_SCOPE.job([job.into()])
}
