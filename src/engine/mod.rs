//! The memoizing run scheduler.
//!
//! Every call of [`Cx::run`] on a job creates a run context under the
//! caller's context. The first run of a fingerprint is a *primary*: it
//! executes the task and becomes the collection's main iteration. Later runs
//! of the same fingerprint, concurrent or not, are *repeats* that share the
//! primary's outcome until the collection is invalidated.

mod context;
mod diagnostics;
mod guard;
#[cfg(test)]
mod tests;

use std::any::{Any, type_name};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use tracing::{Instrument, debug, trace};

use crate::core::lock;
use crate::engine::context::{State, Work};
use crate::error::{EngineError, JobError};
use crate::slug::{Fingerprint, Slug};
use crate::sync::{DEFAULT_YIELDS, Semaphore, TurnLock};
use crate::task::{Job, Registry, Task, TaskOptions};
use crate::value::{Outcome, Value};

pub use crate::engine::context::ContextId;
pub use crate::engine::diagnostics::{DependencyTree, GraphNode};
pub use crate::engine::guard::{FnGuard, Guard, guard_scope};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduling quanta yielded between grants of the turn lock.
    pub turn_yields: usize,
    /// Scheduling quanta yielded between semaphore grants.
    pub semaphore_yields: usize,
    /// Limit of semaphores created by [`tasks::semaphore`](crate::tasks::semaphore).
    pub default_semaphore_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            turn_yields: DEFAULT_YIELDS,
            semaphore_yields: DEFAULT_YIELDS,
            default_semaphore_limit: 8,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_yields(mut self, yields: usize) -> Self {
        self.turn_yields = yields;
        self
    }

    pub fn semaphore_yields(mut self, yields: usize) -> Self {
        self.semaphore_yields = yields;
        self
    }

    pub fn default_semaphore_limit(mut self, limit: usize) -> Self {
        self.default_semaphore_limit = limit;
        self
    }
}

/// Handle to one memo of job outcomes.
///
/// Clones share the same state. Separate engines share nothing.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    state: Mutex<State>,
    registry: Registry,
    turn: TurnLock,
    active: Mutex<Option<ContextId>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let turn = TurnLock::new(config.turn_yields);
        Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(State::default()),
                registry: Registry::new(),
                turn,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// A context handle that runs values on behalf of no job.
    pub fn root(&self) -> Cx {
        Cx {
            engine: self.clone(),
            context: None,
        }
    }

    /// Runs `value` from the top level.
    pub async fn run(&self, value: impl Into<Value>) -> Result<Value, JobError> {
        self.root().run(value).await
    }

    /// Wraps `handler` into a task memoized by this engine's registry.
    pub fn register<F, Fut, R>(&self, handler: F, options: TaskOptions) -> Task
    where
        F: Fn(Cx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Value>,
    {
        self.inner.registry.get_or_create(handler, options)
    }

    /// A semaphore paced like the rest of this engine.
    pub fn semaphore(&self, limit: usize) -> Semaphore {
        Semaphore::with_yields(limit, self.inner.config.semaphore_yields)
    }

    /// Marks every memoized outcome that depends on one of `changes` as
    /// stale, so the next run recomputes it.
    ///
    /// Returns the number of collections touched.
    pub fn announce_changes<I>(&self, changes: I) -> usize
    where
        I: IntoIterator,
        I::Item: Fingerprint,
    {
        let mut state = lock(&self.inner.state);
        let mut touched = 0;

        for change in changes {
            let slug = change.fingerprint();
            let count = state.invalidate(&slug);
            debug!(slug = %slug, collections = count, "announced change");
            touched += count;
        }

        touched
    }

    /// Fingerprint of the most recently activated context.
    pub fn active(&self) -> Option<Slug> {
        let active = *lock(&self.inner.active);
        active.map(|id| lock(&self.inner.state).context(id).slug.clone())
    }

    /// Number of contexts ever created.
    pub fn context_count(&self) -> usize {
        lock(&self.inner.state).context_count()
    }

    /// Waits for a turn, then points the active context at `to`.
    async fn switch(&self, to: Option<ContextId>) {
        self.inner.turn.acquire().await;
        *lock(&self.inner.active) = to;
    }

    fn execute(&self, job: Job, slug: Slug, id: ContextId) -> Work {
        let engine = self.clone();
        let span = tracing::debug_span!("job", task = job.task().name(), slug = %slug);

        async move {
            engine.switch(Some(id)).await;
            debug!("executing");

            let cx = Cx {
                engine: engine.clone(),
                context: Some(id),
            };

            let outcome = job
                .task()
                .invoke(cx, job.input().to_vec(), slug)
                .await
                .map_err(JobError::from);

            engine.release_guards(id).await;

            match &outcome {
                Ok(_) => debug!("settled"),
                Err(err) => debug!(error = %err, "failed"),
            }

            outcome
        }
        .instrument(span)
        .boxed()
        .shared()
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("contexts", &self.context_count())
            .finish()
    }
}

/// The context a handler runs in.
///
/// Every handler receives the `Cx` of its own execution; values run through
/// it are recorded as dependencies of that execution.
#[derive(Clone)]
pub struct Cx {
    engine: Engine,
    context: Option<ContextId>,
}

impl Cx {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Fingerprint of the job this context belongs to.
    pub fn slug(&self) -> Option<Slug> {
        let id = self.context?;
        Some(lock(&self.engine.inner.state).context(id).slug.clone())
    }

    /// Runs `value` and records it as a dependency of this context.
    ///
    /// Jobs are memoized by fingerprint, deferred values are awaited and
    /// their result run in turn, anything else is returned as is.
    pub fn run(&self, value: impl Into<Value>) -> BoxFuture<'static, Result<Value, JobError>> {
        let cx = self.clone();
        let value = value.into();
        async move {
            match value {
                Value::Job(job) => cx.run_job(job).await,
                Value::Deferred(deferred) => {
                    let outcome = deferred.resolve().await;
                    cx.engine.switch(cx.context).await;
                    cx.run(outcome?).await
                }
                other => {
                    cx.track(&other);
                    Ok(other)
                }
            }
        }
        .boxed()
    }

    /// Runs every value concurrently, keeping their order.
    pub async fn run_all<I>(&self, values: I) -> Result<Vec<Value>, JobError>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        try_join_all(values.into_iter().map(|value| self.run(value))).await
    }

    async fn run_job(self, job: Job) -> Outcome {
        let slug = job.fingerprint();

        let work = {
            let mut state = lock(&self.engine.inner.state);
            let collection = state.find_or_create(&slug);

            match state.fresh_work(collection) {
                Some((main, work)) if slug.is_cacheable() => {
                    state.create_repeat(slug.clone(), collection, self.context, Some(main));
                    debug!(slug = %slug, "repeat");
                    work
                }
                _ => {
                    let id = state.create_primary(slug.clone(), collection, self.context);
                    debug!(slug = %slug, index = state.context(id).index, "primary");

                    let work = self.engine.execute(job, slug.clone(), id);
                    state.context_mut(id).work = Some(work.clone());
                    if slug.is_cacheable() {
                        state.publish(id);
                    }
                    work
                }
            }
        };

        let outcome = work.await;
        self.engine.switch(self.context).await;
        outcome
    }

    /// Values that carry a dependency-flagged fingerprint leave an edge
    /// under this context.
    fn track(&self, value: &Value) {
        let Some(parent) = self.context else {
            return;
        };
        let Some(slug) = value.carried_fingerprint() else {
            return;
        };
        if !slug.is_dependency() {
            return;
        }

        let mut state = lock(&self.engine.inner.state);
        let collection = state.find_or_create(&slug);
        // A stale main is replaced by the fresh record, a live one is kept.
        let main = state
            .collection(collection)
            .main
            .filter(|&main| state.context(main).up_to_date);
        let id = state.create_repeat(slug.clone(), collection, Some(parent), main);
        if slug.is_cacheable() && main.is_none() {
            state.publish(id);
        }
        trace!(slug = %slug, "tracked dependency");
    }

    /// Declares that the current job depends on `dependencies`, so
    /// announcing a change to any of them invalidates it.
    pub fn add_dependencies<I>(&self, dependencies: I) -> Result<(), EngineError>
    where
        I: IntoIterator,
        I::Item: Fingerprint,
    {
        let current = self.context.ok_or(EngineError::Detached)?;
        let mut state = lock(&self.engine.inner.state);

        let mut leaves = state.leaves(current);
        if leaves.is_empty() {
            leaves.push(current);
        }

        for dependency in dependencies {
            let slug = dependency.fingerprint();
            let collection = state.find_or_create(&slug);
            for &leaf in &leaves {
                state.create_repeat(slug.clone(), collection, Some(leaf), None);
            }
            debug!(slug = %slug, leaves = leaves.len(), "declared dependency");
        }

        Ok(())
    }

    /// Runs `value` and unwraps the payload of the entity it yields.
    pub async fn deref_input<T>(&self, value: impl Into<Value>) -> anyhow::Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.run(value).await?;
        value
            .as_entity()
            .and_then(|entity| entity.payload_arc::<T>())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "{} does not dereference to {}",
                    value.fingerprint(),
                    type_name::<T>()
                )
            })
    }
}

impl Debug for Cx {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cx").field("context", &self.context).finish()
    }
}
