//! A small library of built-in jobs.

use std::fmt::Display;
use std::sync::{Arc, LazyLock};

use futures::FutureExt;

use crate::core::Hash32;
use crate::engine::Cx;
use crate::error::JobError;
use crate::slug::{Fingerprint, Slug};
use crate::sync::Semaphore;
use crate::task::{Job, Task, TaskFuture, TaskOptions};
use crate::value::{Entity, Value};

/// An entity standing for `content`, fingerprinted by its hash and carrying
/// the content as a `String` payload.
pub fn source(content: impl Into<String>) -> Value {
    let content = content.into();
    let slug = source_slug(&content).as_dependency();
    Value::Entity(Entity::with_payload(slug, content))
}

static ALL: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, input: Vec<Value>| async move { anyhow::Ok(Value::list(input)) },
        TaskOptions::new().name("all"),
    )
});

/// Runs every item concurrently, yielding their results in order.
pub fn all<I>(items: I) -> Job
where
    I: IntoIterator,
    I::Item: Into<Value>,
{
    ALL.job(items)
}

static GET: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, input: Vec<Value>| async move {
            let [value, key] = input.as_slice() else {
                anyhow::bail!("get expects a value and a key");
            };
            let Some(key) = key.as_str() else {
                anyhow::bail!("get expects a string key, got {key:?}");
            };
            anyhow::Ok(value.get(key).cloned().unwrap_or(Value::Void))
        },
        TaskOptions::new().name("get"),
    )
});

/// Field `key` of the map `value` resolves to, or void if it has none.
pub fn get(value: impl Into<Value>, key: &str) -> Job {
    GET.job([value.into(), Value::from(key)])
}

static SEMAPHORE: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let name = input.first().cloned().unwrap_or(Value::Void);
            let limit = cx.engine().config().default_semaphore_limit;
            let semaphore = cx.engine().semaphore(limit);
            anyhow::Ok(Entity::with_payload(crate::slug!("semaphore({})", name), semaphore))
        },
        TaskOptions::new().name("semaphore"),
    )
});

/// A named semaphore shared by every job of the same engine that asks for
/// the same name.
pub fn semaphore(name: &str) -> Job {
    SEMAPHORE.job([name])
}

static SEMAPHORE_GUARD: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let semaphore = cx.deref_input::<Semaphore>(input[0].clone()).await?;
            let guard = semaphore.lock().await;
            cx.add_guard(guard)?;
            anyhow::Ok(Value::Void)
        },
        TaskOptions::new()
            .name("semaphoreGuard")
            .fingerprint(|input| crate::slug!("semaphoreGuard({})", input[0]).uncacheable()),
    )
});

/// Takes a slot of `semaphore` and holds it until the enclosing guard scope
/// settles, see [`guard_scope`](crate::guard_scope).
pub fn semaphore_guard(semaphore: impl Into<Value>) -> Job {
    SEMAPHORE_GUARD.job([semaphore.into()])
}

static INIT_RESOURCE: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, mut input: Vec<Value>| async move { anyhow::Ok(input.pop().unwrap_or(Value::Void)) },
        TaskOptions::new()
            .name("initResource")
            .fingerprint(|input| input[0].fingerprint()),
    )
});

/// Produces `value` under the fingerprint of `resource`, so jobs that run
/// the resource depend on whatever initialised it.
pub fn init_resource(resource: impl Into<Value>, value: impl Into<Value>) -> Job {
    INIT_RESOURCE.job([resource.into(), value.into()])
}

static ON_ERROR: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, mut input: Vec<Value>| async move { anyhow::Ok(input.swap_remove(0)) },
        TaskOptions::new()
            .name("onError")
            .derive_input(|cx: Cx, input: Vec<Value>| async move {
                let mut input = input.into_iter();
                let job = input.next().unwrap_or(Value::Void);
                let fallback = input.next().unwrap_or(Value::Void);
                recover(cx, job, |_| fallback).await
            }),
    )
});

/// Runs `job`, or `fallback` if it fails.
pub fn on_error(job: impl Into<Value>, fallback: impl Into<Value>) -> Job {
    ON_ERROR.job([job.into(), fallback.into()])
}

/// Runs `job`, or if it fails whatever `fallback` makes of the error.
///
/// `name` stands in for the fallback in the fingerprint.
pub fn on_error_with<F>(job: impl Into<Value>, name: &str, fallback: F) -> Job
where
    F: Fn(&JobError) -> Value + Send + Sync + 'static,
{
    let fallback = Arc::new(fallback);
    let task = Task::new(
        |_, mut input: Vec<Value>| async move { anyhow::Ok(input.swap_remove(0)) },
        TaskOptions::new()
            .name("onError")
            .derive_input(move |cx: Cx, input: Vec<Value>| {
                let fallback = fallback.clone();
                async move {
                    let job = input.into_iter().next().unwrap_or(Value::Void);
                    recover(cx, job, |err| (*fallback)(err)).await
                }
            }),
    );
    task.job([job.into(), Value::from(name)])
}

async fn recover<F>(cx: Cx, job: Value, fallback: F) -> anyhow::Result<Vec<Value>>
where
    F: FnOnce(&JobError) -> Value + Send,
{
    let value = match cx.run(job).await {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "running fallback");
            cx.run(fallback(&err)).await?
        }
    };
    anyhow::Ok(vec![value])
}

static RESOLVE: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, mut input: Vec<Value>| async move { anyhow::Ok(input.pop().unwrap_or(Value::Void)) },
        TaskOptions::new().name("resolve"),
    )
});

/// Whatever `value` resolves to, as a job of its own.
pub fn resolve(value: impl Into<Value>) -> Job {
    RESOLVE.job([value.into()])
}

static REJECT: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |_, input: Vec<Value>| async move {
            let reason = input.first().cloned().unwrap_or(Value::Void);
            match reason.as_str() {
                Some(message) => Err::<Value, _>(anyhow::anyhow!("{message}")),
                None => Err(anyhow::anyhow!("rejected with {}", reason.fingerprint())),
            }
        },
        TaskOptions::new().name("reject"),
    )
});

/// A job that always fails with `reason`.
pub fn reject(reason: impl Display) -> Job {
    REJECT.job([reason.to_string()])
}

static AFTER: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let mut output = Value::Void;
            for job in input {
                output = cx.run(job).await?;
            }
            anyhow::Ok(output)
        },
        TaskOptions::new()
            .name("after")
            .derive_input(|_, input: Vec<Value>| async move { anyhow::Ok(input) }),
    )
});

/// Runs `jobs` one after another, yielding the result of the last one.
pub fn after<I>(jobs: I) -> Job
where
    I: IntoIterator,
    I::Item: Into<Value>,
{
    AFTER.job(jobs)
}

static PROPS: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let Some(fields) = input.first().and_then(Value::as_map) else {
                anyhow::bail!("props expects a map");
            };
            let values = cx.run_all(fields.values().cloned()).await?;
            anyhow::Ok(Value::map(fields.keys().cloned().zip(values)))
        },
        TaskOptions::new().name("props"),
    )
});

/// Runs every field concurrently, yielding a map of their results.
pub fn props<I, K, V>(fields: I) -> Job
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    PROPS.job([Value::map(fields.into_iter().map(|(k, v)| (k, v.into())))])
}

/// Runs `op` on every item of the list `items` resolves to.
pub fn map(items: impl Into<Value>, op: &Task) -> Job {
    let name = op.name().to_string();
    let op = op.clone();
    let task = Task::new(
        move |_, input: Vec<Value>| {
            let op = op.clone();
            async move {
                let Some(items) = input.first().and_then(Value::as_list) else {
                    anyhow::bail!("map expects a list");
                };
                anyhow::Ok(Value::from(all(items.iter().map(|item| op.job([item.clone()])))))
            }
        },
        TaskOptions::new()
            .name("map")
            .fingerprint(move |input| crate::slug!("map({},{})", input[0], name)),
    );
    task.job([items.into()])
}

/// Resolves the first input, keeps the rest as given.
fn run_first(cx: Cx, mut input: Vec<Value>) -> TaskFuture<Vec<Value>> {
    async move {
        if let Some(first) = input.first_mut() {
            *first = cx.run(first.clone()).await?;
        }
        anyhow::Ok(input)
    }
    .boxed()
}

fn fingerprints(values: &Value) -> Vec<Slug> {
    values
        .as_list()
        .unwrap_or_default()
        .iter()
        .map(Value::fingerprint)
        .collect()
}

static CHANGED_BY: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let [value, inputs] = input.as_slice() else {
                anyhow::bail!("changedBy expects a value and its inputs");
            };
            cx.add_dependencies(fingerprints(inputs))?;
            anyhow::Ok(value.clone())
        },
        TaskOptions::new().name("changedBy").derive_input(run_first),
    )
});

/// Yields `value`, recomputed whenever one of `inputs` is announced as
/// changed.
pub fn changed_by<I>(value: impl Into<Value>, inputs: I) -> Job
where
    I: IntoIterator,
    I::Item: Fingerprint,
{
    let inputs = inputs.into_iter().map(|input| Value::from(input.fingerprint()));
    CHANGED_BY.job([value.into(), Value::list(inputs)])
}

static CHANGES: LazyLock<Task> = LazyLock::new(|| {
    Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let [value, outputs] = input.as_slice() else {
                anyhow::bail!("changes expects a value and its outputs");
            };
            cx.engine().announce_changes(fingerprints(outputs));
            anyhow::Ok(value.clone())
        },
        TaskOptions::new().name("changes").derive_input(run_first),
    )
});

/// Yields `value`, announcing `outputs` as changed once it is known.
pub fn changes<I>(value: impl Into<Value>, outputs: I) -> Job
where
    I: IntoIterator,
    I::Item: Fingerprint,
{
    let outputs = outputs.into_iter().map(|output| Value::from(output.fingerprint()));
    CHANGES.job([value.into(), Value::list(outputs)])
}

/// Fingerprint of the entity [`source`] creates for `content`.
pub fn source_slug(content: &str) -> Slug {
    crate::slug!("source(b3#{})", &Hash32::hash(content).to_hex()[..32])
}
