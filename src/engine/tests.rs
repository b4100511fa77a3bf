use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;

use super::*;
use crate::slug;
use crate::tasks;

/// A task that counts its executions and squares its first input.
fn counted_square(calls: &Arc<AtomicUsize>) -> Task {
    let calls = calls.clone();
    Task::new(
        move |_, input: Vec<Value>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                let n = input[0].as_int().unwrap_or_default();
                anyhow::Ok(n * n)
            }
        },
        TaskOptions::new().name("square"),
    )
}

#[tokio::test]
async fn test_memoizes_by_fingerprint() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let a = engine.run(square.job([3])).await.unwrap();
    let b = engine.run(square.job([3])).await.unwrap();

    assert_eq!(a, Value::from(9));
    assert_eq!(b, Value::from(9));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let c = engine.run(square.job([4])).await.unwrap();
    assert_eq!(c, Value::from(16));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_execution() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let runs = (0..5).map(|_| engine.run(square.job([7])));
    let results = join_all(runs).await;

    assert!(results.iter().all(|res| res.as_ref().unwrap() == &Value::from(49)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // One primary and four repeats.
    assert_eq!(engine.context_count(), 5);
}

#[tokio::test]
async fn test_uncacheable_always_executes() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let now = {
        let calls = calls.clone();
        Task::new(
            move |_, _| {
                let calls = calls.clone();
                async move { anyhow::Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            TaskOptions::new()
                .name("now")
                .fingerprint(|_| Slug::new("now()").uncacheable()),
        )
    };

    let a = engine.run(now.job(Vec::<Value>::new())).await.unwrap();
    let b = engine.run(now.job(Vec::<Value>::new())).await.unwrap();

    assert_eq!(a, Value::from(1));
    assert_eq!(b, Value::from(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// `read(file)` depends on a dependency-flagged entity, `page(file)` runs
/// `read(file)`.
fn read_and_page(reads: &Arc<AtomicUsize>, pages: &Arc<AtomicUsize>) -> (Task, Task) {
    let read = {
        let reads = reads.clone();
        Task::new(
            move |_, input: Vec<Value>| {
                let reads = reads.clone();
                async move {
                    reads.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(format!("contents of {}", input[0].fingerprint()))
                }
            },
            TaskOptions::new().name("read"),
        )
    };

    let page = {
        let pages = pages.clone();
        let read = read.clone();
        Task::new(
            move |cx: Cx, input: Vec<Value>| {
                let pages = pages.clone();
                let read = read.clone();
                async move {
                    pages.fetch_add(1, Ordering::SeqCst);
                    let body = cx.run(read.job([input[0].clone()])).await?;
                    anyhow::Ok(Value::map([("body", body)]))
                }
            },
            TaskOptions::new().name("page"),
        )
    };

    (read, page)
}

fn file(name: &str) -> Value {
    Value::from(slug!("file({})", name).as_dependency())
}

#[tokio::test]
async fn test_announce_invalidates_dependents() {
    let engine = Engine::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let pages = Arc::new(AtomicUsize::new(0));
    let (_, page) = read_and_page(&reads, &pages);

    let first = engine.run(page.job([file("a")])).await.unwrap();
    assert_eq!(first.get("body").and_then(Value::as_str), Some("contents of file(a)"));
    engine.run(page.job([file("a")])).await.unwrap();
    assert_eq!((reads.load(Ordering::SeqCst), pages.load(Ordering::SeqCst)), (1, 1));

    assert!(engine.announce_changes([slug!("file({})", "a")]) >= 3);

    engine.run(page.job([file("a")])).await.unwrap();
    assert_eq!((reads.load(Ordering::SeqCst), pages.load(Ordering::SeqCst)), (2, 2));
}

#[tokio::test]
async fn test_tracked_entity_is_fresh_after_rerun() {
    let engine = Engine::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let pages = Arc::new(AtomicUsize::new(0));
    let (_, page) = read_and_page(&reads, &pages);

    engine.run(page.job([file("a")])).await.unwrap();
    engine.announce_changes([slug!("file({})", "a")]);
    assert_eq!(engine.dependency_tree(&file("a")).up_to_date, Some(false));

    engine.run(page.job([file("a")])).await.unwrap();

    let tree = engine.dependency_tree(&page.job([file("a")]));
    assert_eq!(tree.up_to_date, Some(true));
    assert_eq!(tree.dependencies[0].slug, "file(a)");
    assert_eq!(tree.dependencies[0].up_to_date, Some(true));
    assert!(!tree.render().contains("[outOfDate]"));

    let graph = engine.graph();
    let file_node = graph
        .node_weights()
        .find(|node| node.slug.key() == "file(a)")
        .unwrap();
    assert_eq!(file_node.up_to_date, Some(true));
}

#[tokio::test]
async fn test_announce_job_fingerprint() {
    let engine = Engine::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let pages = Arc::new(AtomicUsize::new(0));
    let (read, page) = read_and_page(&reads, &pages);

    engine.run(page.job([file("a")])).await.unwrap();
    engine.run(page.job([file("b")])).await.unwrap();

    // Only the dependents of `read(file(a))` are touched.
    engine.announce_changes([read.job([file("a")])]);

    engine.run(page.job([file("a")])).await.unwrap();
    engine.run(page.job([file("b")])).await.unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 3);
    assert_eq!(pages.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_announce_unknown_is_noop() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    engine.run(square.job([3])).await.unwrap();
    assert_eq!(engine.announce_changes([Slug::new("never-seen")]), 0);
    engine.run(square.job([3])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_add_dependencies() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let square = {
        let calls = calls.clone();
        Task::new(
            move |cx: Cx, input: Vec<Value>| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cx.add_dependencies([Slug::new("config")])?;
                    let n = input[0].as_int().unwrap_or_default();
                    anyhow::Ok(n * n)
                }
            },
            TaskOptions::new().name("square"),
        )
    };

    assert_eq!(engine.run(square.job([3])).await.unwrap(), Value::from(9));
    assert_eq!(engine.run(square.job([3])).await.unwrap(), Value::from(9));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.announce_changes([Slug::new("unrelated")]);
    engine.run(square.job([3])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    engine.announce_changes([Slug::new("config")]);
    assert_eq!(engine.run(square.job([3])).await.unwrap(), Value::from(9));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_add_dependencies_detached() {
    let engine = Engine::new();
    let res = engine.root().add_dependencies([Slug::new("config")]);
    assert!(matches!(res, Err(EngineError::Detached)));
}

#[tokio::test]
async fn test_dependency_tree() {
    let engine = Engine::new();
    let leaf = Task::new(
        |_, input: Vec<Value>| async move { anyhow::Ok(input[0].clone()) },
        TaskOptions::new().name("leaf"),
    );
    let root = {
        let leaf = leaf.clone();
        Task::new(
            move |cx: Cx, _| {
                let leaf = leaf.clone();
                async move {
                    let b = cx.run(leaf.job(["b"])).await?;
                    let c = cx.run(leaf.job(["c"])).await?;
                    anyhow::Ok(Value::map([("b", b), ("c", c)]))
                }
            },
            TaskOptions::new().name("root"),
        )
    };

    let job = root.job([1]);
    let output = engine.run(job.clone()).await.unwrap();
    assert_eq!(output.fingerprint().key(), "root(1)");

    let tree = engine.dependency_tree(&output);
    assert_eq!(tree.slug, "root(1)");
    assert_eq!(tree.index, Some(1));
    assert_eq!(tree.up_to_date, Some(true));

    let children: Vec<_> = tree.dependencies.iter().map(|dep| dep.slug.as_str()).collect();
    assert_eq!(children, ["leaf(b)", "leaf(c)"]);
    assert!(tree.dependencies.iter().all(|dep| dep.dependencies.is_empty()));

    assert_eq!(engine.dependency_tree(&job), tree);

    engine.announce_changes([leaf.job(["c"])]);
    let stale = engine.dependency_tree(&job);
    assert_eq!(stale.up_to_date, Some(false));
    assert!(stale.render().starts_with("[#1] [outOfDate] root(1)"));
}

#[tokio::test]
async fn test_graph_export() {
    let engine = Engine::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let pages = Arc::new(AtomicUsize::new(0));
    let (_, page) = read_and_page(&reads, &pages);

    engine.run(page.job([file("a")])).await.unwrap();

    engine.run(page.job([file("a")])).await.unwrap();

    let graph = engine.graph();
    let page_node = graph
        .node_weights()
        .find(|node| node.slug.key() == "page(file(a))")
        .unwrap();
    assert_eq!(page_node.repeats, 1);
    assert_eq!(page_node.up_to_date, Some(true));

    let slugs: Vec<_> = graph.node_weights().map(|node| node.slug.key().to_string()).collect();
    assert!(slugs.contains(&"page(file(a))".to_string()));
    assert!(slugs.contains(&"read(file(a))".to_string()));
    assert!(slugs.contains(&"file(a)".to_string()));
    // page -> file, page -> read, read -> file
    assert_eq!(graph.edge_count(), 3);
}

static RELEASES: AtomicUsize = AtomicUsize::new(0);

async fn failing(cx: Cx, _: Vec<Value>) -> anyhow::Result<Value> {
    cx.add_guard(FnGuard::new(|| {
        RELEASES.fetch_add(1, Ordering::SeqCst);
    }))?;
    tokio::task::yield_now().await;
    anyhow::bail!("boom")
}

#[tokio::test]
async fn test_failure_fans_out_and_releases_guards() {
    let engine = Engine::new();
    let task = Task::new(failing, TaskOptions::new().name("failing"));

    let runs = (0..3).map(|_| engine.run(task.job([1])));
    let errors: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|res| res.unwrap_err())
        .collect();

    assert_eq!(errors[0].to_string(), "boom");
    assert!(errors.iter().all(|err| err.same_as(&errors[0])));
    assert_eq!(RELEASES.load(Ordering::SeqCst), 1);

    // The failure stays memoized until invalidated.
    let again = engine.run(task.job([1])).await.unwrap_err();
    assert!(again.same_as(&errors[0]));
    assert_eq!(RELEASES.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_forwarded_failure_is_unchanged() {
    let engine = Engine::new();
    let inner = Task::new(
        |_, _| async move { Err::<Value, _>(anyhow::anyhow!("inner")) },
        TaskOptions::new().name("inner"),
    );
    let outer = {
        let inner = inner.clone();
        Task::new(
            move |cx: Cx, _| {
                let inner = inner.clone();
                async move { anyhow::Ok(cx.run(inner.job([1])).await?) }
            },
            TaskOptions::new().name("outer"),
        )
    };

    let outer_err = engine.run(outer.job([1])).await.unwrap_err();
    let inner_err = engine.run(inner.job([1])).await.unwrap_err();
    assert!(outer_err.same_as(&inner_err));
}

#[tokio::test]
async fn test_guard_scope_holds_guards() {
    let engine = Engine::new();
    let released = Arc::new(AtomicUsize::new(0));

    let acquire = {
        let released = released.clone();
        Task::new(
            move |cx: Cx, _| {
                let released = released.clone();
                async move {
                    cx.add_guard(FnGuard::new(move || {
                        released.fetch_add(1, Ordering::SeqCst);
                    }))?;
                    anyhow::Ok(())
                }
            },
            TaskOptions::new().name("acquire"),
        )
    };

    let work = {
        let released = released.clone();
        Task::new(
            move |cx: Cx, _| {
                let released = released.clone();
                let acquire = acquire.clone();
                async move {
                    cx.run(acquire.job([1])).await?;
                    anyhow::Ok(released.load(Ordering::SeqCst))
                }
            },
            TaskOptions::new().name("work"),
        )
    };

    // Held by the scope while `work` is still running.
    let seen = engine.run(guard_scope(work.job([1]))).await.unwrap();
    assert_eq!(seen, Value::from(0));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_guard_without_scope_releases_with_its_job() {
    let engine = Engine::new();
    let released = Arc::new(AtomicUsize::new(0));

    let acquire = {
        let released = released.clone();
        Task::new(
            move |cx: Cx, _| {
                let released = released.clone();
                async move {
                    cx.add_guard(FnGuard::new(move || {
                        released.fetch_add(1, Ordering::SeqCst);
                    }))?;
                    anyhow::Ok(())
                }
            },
            TaskOptions::new().name("acquire"),
        )
    };

    let work = {
        let released = released.clone();
        Task::new(
            move |cx: Cx, _| {
                let released = released.clone();
                let acquire = acquire.clone();
                async move {
                    cx.run(acquire.job([1])).await?;
                    anyhow::Ok(released.load(Ordering::SeqCst))
                }
            },
            TaskOptions::new().name("work"),
        )
    };

    let seen = engine.run(work.job([1])).await.unwrap();
    assert_eq!(seen, Value::from(1));
}

#[tokio::test]
async fn test_semaphore_guard_bounds_concurrency() {
    let engine = Engine::with_config(Config::new().default_semaphore_limit(1));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let worker = {
        let running = running.clone();
        let peak = peak.clone();
        Task::new(
            move |cx: Cx, input: Vec<Value>| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    cx.run(tasks::semaphore_guard(tasks::semaphore("cpu"))).await?;

                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    for _ in 0..10 {
                        tokio::task::yield_now().await;
                    }
                    running.fetch_sub(1, Ordering::SeqCst);

                    anyhow::Ok(input[0].clone())
                }
            },
            TaskOptions::new().name("worker"),
        )
    };

    let runs = (0..3).map(|i| engine.run(guard_scope(worker.job([i]))));
    let results = join_all(runs).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plain_values_pass_through() {
    let engine = Engine::new();
    assert_eq!(engine.run(5).await.unwrap(), Value::from(5));
    assert_eq!(engine.run("x").await.unwrap(), Value::from("x"));
    assert_eq!(engine.context_count(), 0);
}

#[tokio::test]
async fn test_deferred_result_is_run() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let job = square.job([5]);
    let deferred = Value::deferred(async move { anyhow::Ok(Value::from(job)) });

    assert_eq!(engine.run(deferred).await.unwrap(), Value::from(25));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_nested_jobs_in_output_are_resolved() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let pair = {
        let square = square.clone();
        Task::new(
            move |_, _| {
                let square = square.clone();
                async move {
                    anyhow::Ok(Value::map([
                        ("a", Value::from(square.job([2]))),
                        ("b", Value::list([square.job([3])])),
                    ]))
                }
            },
            TaskOptions::new().name("pair"),
        )
    };

    let output = engine.run(pair.job([0])).await.unwrap();
    assert_eq!(output.get("a"), Some(&Value::from(4)));
    assert_eq!(
        output.get("b").and_then(Value::as_list),
        Some([Value::from(9)].as_slice())
    );
    assert_eq!(output.fingerprint().key(), "pair(0)");
}

#[tokio::test]
async fn test_inputs_are_resolved() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let nested = square.job([square.job([2])]);
    assert_eq!(nested.fingerprint().key(), "square(square(2))");
    assert_eq!(engine.run(nested).await.unwrap(), Value::from(16));
}

#[tokio::test]
async fn test_middleware_replaces_pipeline() {
    let engine = Engine::new();
    let task = Task::new(
        |_, input: Vec<Value>| async move { anyhow::Ok(input.len()) },
        TaskOptions::new()
            .name("count")
            .middleware(|task: Task, cx: Cx, input: Vec<Value>, slug: Slug| async move {
                let raw = task.call(cx, input).await?;
                anyhow::Ok(Value::from(format!("{slug}={}", raw.fingerprint())))
            }),
    );

    let output = engine.run(task.job([1, 2])).await.unwrap();
    assert_eq!(output, Value::from("count(1,2)=2"));
}

#[tokio::test]
async fn test_builtin_tasks() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let all = engine
        .run(tasks::all([square.job([1]), square.job([2]), square.job([3])]))
        .await
        .unwrap();
    assert_eq!(all, Value::list([1, 4, 9]));

    let map = Value::map([("id", Value::from(7))]);
    assert_eq!(engine.run(tasks::get(map.clone(), "id")).await.unwrap(), Value::from(7));
    assert!(engine.run(tasks::get(map, "missing")).await.unwrap().is_void());

    let boom = Task::new(
        |_, _| async move { Err::<Value, _>(anyhow::anyhow!("boom")) },
        TaskOptions::new().name("boom"),
    );
    let recovered = engine
        .run(tasks::on_error(boom.job([1]), square.job([6])))
        .await
        .unwrap();
    assert_eq!(recovered, Value::from(36));

    let resource = engine
        .run(tasks::init_resource(Slug::new("db"), "connected"))
        .await
        .unwrap();
    assert_eq!(resource, Value::from("connected"));
}

#[tokio::test]
async fn test_after_runs_in_sequence() {
    let engine = Engine::new();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = {
        let order = order.clone();
        Task::new(
            move |_, input: Vec<Value>| {
                let order = order.clone();
                async move {
                    tokio::task::yield_now().await;
                    let name = input[0].as_str().unwrap_or_default().to_string();
                    order.lock().unwrap().push(name.clone());
                    anyhow::Ok(name)
                }
            },
            TaskOptions::new().name("record"),
        )
    };

    let last = engine
        .run(tasks::after([record.job(["a"]), record.job(["b"]), record.job(["c"])]))
        .await
        .unwrap();
    assert_eq!(last, Value::from("c"));
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);

    assert!(engine.run(tasks::after(Vec::<Value>::new())).await.unwrap().is_void());
}

#[tokio::test]
async fn test_resolve_and_reject() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let resolved = engine.run(tasks::resolve(square.job([5]))).await.unwrap();
    assert_eq!(resolved, Value::from(25));
    assert_eq!(engine.run(tasks::resolve("plain")).await.unwrap(), Value::from("plain"));

    let err = engine.run(tasks::reject("nope")).await.unwrap_err();
    assert_eq!(err.to_string(), "nope");

    let recovered = engine
        .run(tasks::on_error(tasks::reject("nope"), square.job([2])))
        .await
        .unwrap();
    assert_eq!(recovered, Value::from(4));
}

#[tokio::test]
async fn test_on_error_with_receives_error() {
    let engine = Engine::new();
    let job = tasks::on_error_with(tasks::reject("boom"), "describe", |err: &JobError| {
        Value::from(format!("recovered from {err}"))
    });
    assert_eq!(job.fingerprint().key(), "onError(reject(boom),describe)");

    let output = engine.run(job).await.unwrap();
    assert_eq!(output, Value::from("recovered from boom"));

    let fine = tasks::on_error_with(tasks::resolve(1), "unused", |_: &JobError| Value::Void);
    assert_eq!(engine.run(fine).await.unwrap(), Value::from(1));
}

#[tokio::test]
async fn test_props_and_map() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    let fields = engine
        .run(tasks::props([
            ("area", Value::from(square.job([4]))),
            ("unit", Value::from("m2")),
        ]))
        .await
        .unwrap();
    assert_eq!(fields.get("area"), Some(&Value::from(16)));
    assert_eq!(fields.get("unit"), Some(&Value::from("m2")));

    let squares = engine.run(tasks::map(Value::list([1, 2, 4]), &square)).await.unwrap();
    assert_eq!(squares, Value::list([1, 4, 16]));
    // square(4) was already memoized by `props`.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let from_job = tasks::map(tasks::all([1, 2]), &square);
    assert_eq!(engine.run(from_job).await.unwrap(), Value::list([1, 4]));
}

#[tokio::test]
async fn test_changed_by_declares_inputs() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);
    let job = || tasks::changed_by(square.job([3]), [Slug::new("config")]);

    assert_eq!(engine.run(job()).await.unwrap(), Value::from(9));
    engine.run(job()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(engine.announce_changes([Slug::new("config")]) > 0);
    assert_eq!(engine.run(job()).await.unwrap(), Value::from(9));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_changes_announces_outputs() {
    let engine = Engine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    engine.run(square.job([3])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let output = engine
        .run(tasks::changes(square.job([2]), [square.job([3])]))
        .await
        .unwrap();
    assert_eq!(output, Value::from(4));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    engine.run(square.job([3])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_runs_without_tokio_runtime() {
    let engine = Engine::new();
    let double = Task::new(
        |_, input: Vec<Value>| async move { anyhow::Ok(input[0].as_int().unwrap_or_default() * 2) },
        TaskOptions::new().name("double"),
    );

    let (done, outcome) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let first = futures::executor::block_on(engine.run(double.job([21])));
        let again = futures::executor::block_on(engine.run(double.job([21])));
        let _ = done.send((first.map_err(|e| e.to_string()), again.is_ok()));
    });

    let (first, again) = outcome
        .recv_timeout(std::time::Duration::from_secs(5))
        .expect("engine stalled outside of a tokio runtime");
    assert_eq!(first, Ok(Value::from(42)));
    assert!(again);
}

#[tokio::test]
async fn test_deref_input() {
    let engine = Engine::new();
    let task = Task::new(
        |cx: Cx, input: Vec<Value>| async move {
            let content = cx.deref_input::<String>(input[0].clone()).await?;
            anyhow::Ok(content.len())
        },
        TaskOptions::new().name("length"),
    );

    let source = tasks::source("hello");
    assert_eq!(engine.run(task.job([source])).await.unwrap(), Value::from(5));
    assert!(engine.run(task.job([1])).await.is_err());
}

#[tokio::test]
async fn test_engine_register_memoizes() {
    async fn handler(_: Cx, _: Vec<Value>) -> anyhow::Result<()> {
        Ok(())
    }

    let engine = Engine::new();
    let a = engine.register(handler, TaskOptions::new().name("noop"));
    let b = engine.register(handler, TaskOptions::new());
    assert!(a.ptr_eq(&b));
    assert!(engine.run(a.job([1])).await.unwrap().is_void());
}

#[tokio::test]
async fn test_active_context() {
    let engine = Engine::new();
    assert_eq!(engine.active(), None);

    let whoami = Task::new(
        |cx: Cx, _| async move {
            let active = cx.engine().active().map(|slug| slug.key().to_string());
            anyhow::Ok(Value::from(active))
        },
        TaskOptions::new().name("whoami"),
    );

    let seen = engine.run(whoami.job([1])).await.unwrap();
    assert_eq!(seen, Value::from("whoami(1)"));
    assert_eq!(engine.active(), None);
}

#[tokio::test]
async fn test_separate_engines_share_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let square = counted_square(&calls);

    Engine::new().run(square.job([3])).await.unwrap();
    Engine::new().run(square.job([3])).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
