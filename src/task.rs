use std::any::TypeId;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};

use crate::core::lock;
use crate::engine::Cx;
use crate::error::JobError;
use crate::slug::{Fingerprint, Slug, abbreviate, join};
use crate::value::Value;

/// What handlers, middleware and input derivation steps return.
pub type TaskFuture<T = Value> = BoxFuture<'static, anyhow::Result<T>>;

type Handler = dyn Fn(Cx, Vec<Value>) -> TaskFuture + Send + Sync;
type FingerprintFn = dyn Fn(&[Value]) -> Slug + Send + Sync;
type DeriveFn = dyn Fn(Cx, Vec<Value>) -> TaskFuture<Vec<Value>> + Send + Sync;
type WrapFn = dyn Fn(Value, &Slug) -> Value + Send + Sync;
type MiddlewareFn = dyn Fn(Task, Cx, Vec<Value>, Slug) -> TaskFuture + Send + Sync;

/// Optional overrides applied when a handler is turned into a [`Task`].
#[derive(Default, Clone)]
pub struct TaskOptions {
    name: Option<Cow<'static, str>>,
    fingerprint: Option<Arc<FingerprintFn>>,
    derive_input: Option<Arc<DeriveFn>>,
    wrap_output: Option<Arc<WrapFn>>,
    middleware: Option<Arc<MiddlewareFn>>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the default `name(inputs...)` fingerprint.
    pub fn fingerprint<F>(mut self, fingerprint: F) -> Self
    where
        F: Fn(&[Value]) -> Slug + Send + Sync + 'static,
    {
        self.fingerprint = Some(Arc::new(fingerprint));
        self
    }

    /// Replaces the default input derivation, which runs every input
    /// concurrently and keeps their order.
    pub fn derive_input<F, Fut>(mut self, derive: F) -> Self
    where
        F: Fn(Cx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Value>>> + Send + 'static,
    {
        self.derive_input = Some(Arc::new(move |cx: Cx, input: Vec<Value>| {
            derive(cx, input).boxed()
        }));
        self
    }

    /// Replaces [`stamp_output`].
    pub fn wrap_output<F>(mut self, wrap: F) -> Self
    where
        F: Fn(Value, &Slug) -> Value + Send + Sync + 'static,
    {
        self.wrap_output = Some(Arc::new(wrap));
        self
    }

    /// Replaces the whole run pipeline. The middleware receives the task
    /// itself, so it can still reach [`Task::call`] or [`Task::pipeline`].
    pub fn middleware<F, Fut>(mut self, middleware: F) -> Self
    where
        F: Fn(Task, Cx, Vec<Value>, Slug) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.middleware = Some(Arc::new(move |task: Task, cx: Cx, input: Vec<Value>, slug: Slug| {
            middleware(task, cx, input, slug).boxed()
        }));
        self
    }
}

static NEXT_TASK: AtomicUsize = AtomicUsize::new(0);

/// A named unit of computation: a handler plus the policy used to
/// fingerprint its input, derive the input before the call and wrap the
/// output afterwards.
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

struct TaskInner {
    name: Cow<'static, str>,
    handler: Arc<Handler>,
    options: TaskOptions,
}

impl Task {
    /// Creates a fresh task. Use [`register`] to reuse the task of a handler
    /// that was already wrapped.
    pub fn new<F, Fut, R>(handler: F, options: TaskOptions) -> Self
    where
        F: Fn(Cx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Value>,
    {
        let index = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| Cow::Owned(format!("nameless#{index}")));

        let handler: Arc<Handler> = Arc::new(move |cx: Cx, input: Vec<Value>| {
            let output = handler(cx, input);
            async move { output.await.map(Into::into) }.boxed()
        });

        Self(Arc::new(TaskInner {
            name,
            handler,
            options,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Describes a call of this task without running it.
    pub fn job<I>(&self, input: I) -> Job
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Job::new(self.clone(), input.into_iter().map(Into::into).collect())
    }

    pub fn fingerprint(&self, input: &[Value]) -> Slug {
        match &self.0.options.fingerprint {
            Some(fingerprint) => fingerprint(input),
            None => default_fingerprint(&self.0.name, input),
        }
    }

    /// Whether both handles refer to the same task.
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn invoke(&self, cx: Cx, input: Vec<Value>, slug: Slug) -> TaskFuture {
        match &self.0.options.middleware {
            Some(middleware) => middleware(self.clone(), cx, input, slug),
            None => self.pipeline(cx, input, slug),
        }
    }

    /// The default run semantics: derive the input, call the handler, run
    /// whatever it returned and stamp the fingerprint on the result.
    pub fn pipeline(&self, cx: Cx, input: Vec<Value>, slug: Slug) -> TaskFuture {
        let task = self.clone();
        async move {
            let input = task.derive(cx.clone(), input).await?;
            let output = task.call(cx.clone(), input).await?;
            let output = resolve_output(cx, output).await?;
            anyhow::Ok(task.wrap(output, &slug))
        }
        .boxed()
    }

    /// Calls the bare handler.
    pub fn call(&self, cx: Cx, input: Vec<Value>) -> TaskFuture {
        (self.0.handler)(cx, input)
    }

    pub fn derive(&self, cx: Cx, input: Vec<Value>) -> TaskFuture<Vec<Value>> {
        match &self.0.options.derive_input {
            Some(derive) => derive(cx, input),
            None => derive_input(cx, input),
        }
    }

    pub fn wrap(&self, output: Value, slug: &Slug) -> Value {
        match &self.0.options.wrap_output {
            Some(wrap) => wrap(output, slug),
            None => stamp_output(output, slug),
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name())
    }
}

fn default_fingerprint(name: &str, input: &[Value]) -> Slug {
    let parts: Vec<_> = input.iter().map(Fingerprint::fingerprint).collect();
    Slug::new(format!("{name}({})", abbreviate(&join(&parts))))
}

fn derive_input(cx: Cx, input: Vec<Value>) -> TaskFuture<Vec<Value>> {
    async move {
        let input = try_join_all(input.into_iter().map(|item| cx.run(item))).await?;
        anyhow::Ok(input)
    }
    .boxed()
}

/// Runs a handler result to completion, including job descriptors nested
/// inside lists and maps.
fn resolve_output(cx: Cx, output: Value) -> BoxFuture<'static, Result<Value, JobError>> {
    async move {
        match cx.run(output).await? {
            Value::List(items) if items.iter().any(needs_run) => {
                let items =
                    try_join_all(items.iter().cloned().map(|item| resolve_output(cx.clone(), item)))
                        .await?;
                Ok(Value::List(Arc::new(items)))
            }
            Value::Map(map) if map.values().any(needs_run) => {
                let values =
                    try_join_all(map.values().cloned().map(|item| resolve_output(cx.clone(), item)))
                        .await?;
                Ok(Value::Map(Arc::new(map.keys().cloned().zip(values).collect())))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

fn needs_run(value: &Value) -> bool {
    !matches!(
        value,
        Value::Void | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
    )
}

/// Default output wrapping.
///
/// Keyed structures get the fingerprint overlaid, an absent result becomes a
/// void marker carrying it, everything else is left as is.
pub fn stamp_output(output: Value, slug: &Slug) -> Value {
    match output {
        Value::Map(_) | Value::Stamped(_) | Value::Void => output.stamp(slug.as_output()),
        other => other,
    }
}

/// An unevaluated call: a task plus its input.
///
/// The fingerprint is computed on first use and then kept.
#[derive(Clone)]
pub struct Job(Arc<JobInner>);

struct JobInner {
    task: Task,
    input: Vec<Value>,
    slug: OnceLock<Slug>,
}

impl Job {
    pub fn new(task: Task, input: Vec<Value>) -> Self {
        Self(Arc::new(JobInner {
            task,
            input,
            slug: OnceLock::new(),
        }))
    }

    pub fn task(&self) -> &Task {
        &self.0.task
    }

    pub fn input(&self) -> &[Value] {
        &self.0.input
    }

    pub fn fingerprint(&self) -> Slug {
        self.0
            .slug
            .get_or_init(|| self.0.task.fingerprint(&self.0.input))
            .clone()
    }
}

impl Fingerprint for Job {
    fn fingerprint(&self) -> Slug {
        Job::fingerprint(self)
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Job({})", self.fingerprint())
    }
}

/// Memoizes tasks by handler identity.
///
/// A zero-sized handler (a function item or a closure that captures
/// nothing) is identified by its type, so wrapping it again returns the same
/// task. Handlers that capture state always get a task of their own.
#[derive(Default)]
pub struct Registry {
    tasks: Mutex<HashMap<TypeId, Task>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<F, Fut, R>(&self, handler: F, options: TaskOptions) -> Task
    where
        F: Fn(Cx, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Value>,
    {
        if size_of::<F>() != 0 {
            return Task::new(handler, options);
        }

        lock(&self.tasks)
            .entry(TypeId::of::<F>())
            .or_insert_with(|| Task::new(handler, options))
            .clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Wraps `handler` into a task through the process-wide [`Registry`].
pub fn register<F, Fut, R>(handler: F, options: TaskOptions) -> Task
where
    F: Fn(Cx, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Value>,
{
    REGISTRY.get_or_create(handler, options)
}
