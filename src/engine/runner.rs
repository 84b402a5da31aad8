use std::collections::{HashMap, HashSet};
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::context::Context;
use crate::core::{Fingerprint, Hash32};
use crate::engine::registry::Task;
use crate::engine::{Artifact, Handle, JournalEntry, Registry, Report, TaskContext, TaskExecution, Target};
use crate::error::{BuildError, FontgraphError};
use crate::utils::{get_style_bar, get_style_task};

struct Built {
    artifact: Artifact,
    entry: JournalEntry,
    executed: bool,
}

enum Outcome {
    Built(Built),
    Failed(anyhow::Error),
    Cancelled,
}

struct Message {
    index: NodeIndex,
    outcome: Outcome,
    start: Instant,
    duration: Duration,
}

/// Brings `targets` and everything they transitively depend on up to date.
///
/// The graph is executed on a dedicated thread pool sized by the context's
/// job count. A task is spawned as soon as its last upstream task has
/// completed:
/// 1. Tasks with no upstream in the requested subgraph are spawned first.
/// 2. The calling thread waits for results on a channel.
/// 3. A success releases its dependents, a failure cancels every transitive
///    dependent, which is then never started. Sibling branches carry on.
/// 4. With fail-fast set, the first failure raises the cancellation signal
///    and no further task starts.
///
/// Each task is skipped when the journal of the previous run shows the same
/// input fingerprint and its outputs are still on disk unchanged. The
/// updated journal is written before returning, also after failures.
pub fn run(registry: &Registry, ctx: &Context, targets: &[Handle]) -> Result<Report, FontgraphError> {
    let graph = &registry.graph;

    petgraph::algo::toposort(graph, None)
        .map_err(|cycle| BuildError::Cycle(graph[cycle.node_id()].key.clone()))?;

    let nodes = ancestors(registry, targets);
    let mut report = Report::default();

    if nodes.is_empty() {
        return Ok(report);
    }

    // Edges inside the requested subgraph only. Every source of such an
    // edge is itself an ancestor of a target.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes.iter().map(|&i| (i, 0)).collect();
    for edge in graph.raw_edges() {
        if let Some(count) = dependency_counts.get_mut(&edge.target()) {
            *count += 1;
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }
    }

    let total_tasks = nodes.len() as u64;
    let mut completed_tasks = 0;

    let root_span = tracing::span!(Level::INFO, "building_tasks");
    root_span.pb_set_length(total_tasks);
    root_span.pb_set_style(&get_style_bar());
    root_span.pb_set_message("Building fonts...");

    // One pool thread is taken by the scheduler loop below.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.jobs + 1)
        .thread_name(|i| format!("fontgraph-{i}"))
        .build()?;

    let pb_style = get_style_task();
    let mut artifacts: HashMap<NodeIndex, Artifact> = HashMap::new();
    let mut resolved: HashSet<NodeIndex> = HashSet::new();
    let mut journal = ctx.journal.clone();

    pool.scope(|s| {
        let (sender, receiver) = channel::<Message>();

        let spawn_task = |artifacts: &HashMap<NodeIndex, Artifact>, index: NodeIndex| {
            let task = &graph[index];
            let inputs: Vec<Artifact> = task
                .dependencies
                .iter()
                .map(|handle| artifacts[&handle.index].clone())
                .collect();

            let sender = sender.clone();
            let pb_style = pb_style.clone();
            let root_span = &root_span;

            s.spawn(move |_| {
                let start = Instant::now();

                let outcome = if ctx.cancel.is_raised() {
                    Outcome::Cancelled
                } else {
                    let span = tracing::span!(parent: root_span, Level::INFO, "task", name = %task.key);
                    span.pb_set_style(&pb_style);
                    span.pb_set_message(&format!("Running {}", task.key));
                    let _enter = span.enter();

                    match execute(task, ctx, &inputs, span.clone()) {
                        Ok(built) => Outcome::Built(built),
                        Err(err) => Outcome::Failed(err),
                    }
                };

                sender
                    .send(Message {
                        index,
                        outcome,
                        start,
                        duration: start.elapsed(),
                    })
                    .unwrap();
            });
        };

        let mut ready: Vec<NodeIndex> = dependency_counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&index, _)| index)
            .collect();
        ready.sort();

        for index in ready {
            spawn_task(&artifacts, index);
        }

        while completed_tasks < total_tasks {
            let Message {
                index,
                outcome,
                start,
                duration,
            } = receiver.recv().unwrap();

            completed_tasks += 1;
            root_span.pb_inc(1);
            resolved.insert(index);

            let key = &graph[index].key;

            match outcome {
                Outcome::Built(Built {
                    artifact,
                    entry,
                    executed,
                }) => {
                    journal.record(key, entry);
                    artifacts.insert(index, artifact);

                    if executed {
                        report.executed.push(key.clone());
                        report
                            .execution_times
                            .insert(key.clone(), TaskExecution { start, duration });
                    } else {
                        report.skipped.push(key.clone());
                    }

                    for &dependent in dependents.get(&index).into_iter().flatten() {
                        if let Some(count) = dependency_counts.get_mut(&dependent) {
                            *count -= 1;
                            if *count == 0 && !resolved.contains(&dependent) {
                                spawn_task(&artifacts, dependent);
                            }
                        }
                    }
                }
                Outcome::Failed(err) => {
                    tracing::error!("{key} failed: {err:#}");
                    journal.remove(key);
                    report.failed.push((key.clone(), err));

                    if ctx.fail_fast {
                        ctx.cancel.raise();
                    }

                    let cancelled = cancel_dependents(registry, index, &dependency_counts, &mut resolved, &mut report);
                    completed_tasks += cancelled;
                    root_span.pb_inc(cancelled);
                }
                Outcome::Cancelled => {
                    report.cancelled.push(key.clone());

                    let cancelled = cancel_dependents(registry, index, &dependency_counts, &mut resolved, &mut report);
                    completed_tasks += cancelled;
                    root_span.pb_inc(cancelled);
                }
            }
        }
    });

    journal.save(&ctx.layout.journal())?;

    if report.is_success() {
        tracing::info!("Build complete!");
    } else {
        tracing::warn!(
            "Build finished with {} failed and {} cancelled tasks",
            report.failed.len(),
            report.cancelled.len()
        );
    }

    Ok(report)
}

/// Every task the targets transitively depend on, targets included.
fn ancestors(registry: &Registry, targets: &[Handle]) -> HashSet<NodeIndex> {
    let reversed = Reversed(&registry.graph);
    let mut nodes = HashSet::new();

    for target in targets {
        let mut dfs = Dfs::new(reversed, target.index);
        while let Some(index) = dfs.next(reversed) {
            nodes.insert(index);
        }
    }

    nodes
}

/// Marks every not yet resolved transitive dependent of `index` inside the
/// requested subgraph as cancelled. Returns how many were marked.
fn cancel_dependents(
    registry: &Registry,
    index: NodeIndex,
    requested: &HashMap<NodeIndex, usize>,
    resolved: &mut HashSet<NodeIndex>,
    report: &mut Report,
) -> u64 {
    let graph = &registry.graph;
    let mut dfs = Dfs::new(graph, index);
    let mut cancelled = 0;

    while let Some(dependent) = dfs.next(graph) {
        if dependent == index || !requested.contains_key(&dependent) {
            continue;
        }
        if resolved.insert(dependent) {
            tracing::debug!("{} cancelled", graph[dependent].key);
            report.cancelled.push(graph[dependent].key.clone());
            cancelled += 1;
        }
    }

    cancelled
}

fn execute(task: &Task, ctx: &Context, inputs: &[Artifact], span: Span) -> anyhow::Result<Built> {
    let input = fingerprint(task, ctx, inputs)?;

    if let Some(entry) = ctx.journal.get(&task.key)
        && entry.input == input
        && is_fresh(task, entry)
    {
        tracing::debug!("{} is up to date", task.key);
        return Ok(Built {
            artifact: artifact(task, entry.output),
            entry: *entry,
            executed: false,
        });
    }

    if let Some(path) = task.target.path() {
        create_parent(path)?;
    }
    for product in &task.products {
        create_parent(product)?;
    }

    let context = TaskContext::new(ctx, &task.key, &task.target, span);

    // Stage actions only read shared state, a panic cannot leave it torn.
    match catch_unwind(AssertUnwindSafe(|| task.recipe.execute(&context, inputs))) {
        Ok(result) => result?,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            return Err(anyhow::anyhow!(msg));
        }
    }

    let output = match &task.target {
        Target::File(path) => {
            if !path.is_file() {
                return Err(missing_output(task, path).into());
            }
            Hash32::hash_file(path)?
        }
        Target::Phony => input,
    };

    for product in &task.products {
        if !product.exists() {
            return Err(missing_output(task, product).into());
        }
    }

    context.cleanup();

    Ok(Built {
        artifact: artifact(task, output),
        entry: JournalEntry { input, output },
        executed: true,
    })
}

/// Input fingerprint of a task: its identity, the toolchain, its salt, the
/// output fingerprints of its upstream tasks and the contents of its source
/// files.
fn fingerprint(task: &Task, ctx: &Context, inputs: &[Artifact]) -> Result<Hash32, BuildError> {
    let mut fp = Fingerprint::new("task");

    fp.str(task.key.stage());
    for param in task.key.params() {
        fp.str(param);
    }

    fp.hash(ctx.snapshot())
        .str(task.target.path().map_or("", Utf8Path::as_str));

    for salt in &task.salt {
        fp.str(salt);
    }

    for input in inputs {
        fp.hash(input.fingerprint);
    }

    for source in &task.sources {
        if !source.is_file() {
            return Err(BuildError::MissingSource(source.clone()));
        }
        fp.hash(Hash32::hash_file(source)?);
    }

    Ok(fp.finish())
}

fn is_fresh(task: &Task, entry: &JournalEntry) -> bool {
    let target = match &task.target {
        Target::File(path) => Hash32::hash_file(path).is_ok_and(|hash| hash == entry.output),
        Target::Phony => entry.output == entry.input,
    };

    target && task.products.iter().all(|product| product.exists())
}

fn artifact(task: &Task, fingerprint: Hash32) -> Artifact {
    Artifact {
        key: task.key.clone(),
        target: task.target.clone(),
        fingerprint,
    }
}

fn missing_output(task: &Task, path: &Utf8Path) -> BuildError {
    BuildError::MissingOutput {
        key: task.key.clone(),
        path: path.to_owned(),
    }
}

fn create_parent(path: &Utf8Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::tests::{MINIMAL, parse};
    use crate::engine::{Plan, TaskDef, TaskKey};
    use crate::tool::fake::FakeExecutor;

    fn context(root: &Utf8Path, jobs: usize) -> Context {
        Context::builder()
            .root(root)
            .config(parse(MINIMAL))
            .executor(FakeExecutor::new(root))
            .jobs(jobs)
            .build()
            .unwrap()
    }

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, root)
    }

    /// A task writing `text` to `build/<name>.txt`, counting its runs.
    fn write(registry: &mut Registry, root: &Utf8Path, name: &str, text: &'static str, runs: Arc<AtomicUsize>) -> Handle {
        let path = root.join("build").join(format!("{name}.txt"));
        registry
            .ensure(TaskKey::new("write", [name]), |_| {
                Ok(TaskDef::file(path).run(move |task, ()| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    fs::write(task.out()?, text)?;
                    Ok(())
                }))
            })
            .unwrap()
    }

    fn concat(registry: &mut Registry, root: &Utf8Path, a: Handle, b: Handle, runs: Arc<AtomicUsize>) -> Handle {
        let path = root.join("build/concat.txt");
        registry
            .ensure(TaskKey::new("concat", ["ab"]), |_| {
                Ok(TaskDef::file(path).depends_on((a, b)).run(move |task, (a, b)| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let text = fs::read_to_string(a.file()?)? + &fs::read_to_string(b.file()?)?;
                    fs::write(task.out()?, text)?;
                    Ok(())
                }))
            })
            .unwrap()
    }

    #[test]
    fn test_runs_in_dependency_order() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 4);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let a = write(&mut registry, &root, "a", "x", runs.clone());
        let b = write(&mut registry, &root, "b", "y", runs.clone());
        let c = concat(&mut registry, &root, a, b, runs.clone());

        let report = run(&registry, &ctx, &[c]).unwrap();
        assert!(report.is_success());
        assert_eq!(report.executed.len(), 3);
        assert_eq!(fs::read_to_string(root.join("build/concat.txt")).unwrap(), "xy");
    }

    #[test]
    fn test_only_requested_subgraph_runs() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 2);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let a = write(&mut registry, &root, "a", "x", runs.clone());
        let _b = write(&mut registry, &root, "b", "y", runs.clone());

        let report = run(&registry, &ctx, &[a]).unwrap();
        assert_eq!(report.executed, vec![TaskKey::new("write", ["a"])]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_second_run_is_skipped() {
        let (_dir, root) = scratch();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let a = write(&mut registry, &root, "a", "x", runs.clone());
        let b = write(&mut registry, &root, "b", "y", runs.clone());
        let c = concat(&mut registry, &root, a, b, runs.clone());

        run(&registry, &context(&root, 2), &[c]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let report = run(&registry, &context(&root, 2), &[c]).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(report.skipped.len(), 3);
    }

    #[test]
    fn test_tampered_output_is_rebuilt() {
        let (_dir, root) = scratch();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let a = write(&mut registry, &root, "a", "x", runs.clone());

        run(&registry, &context(&root, 1), &[a]).unwrap();
        fs::write(root.join("build/a.txt"), "tampered").unwrap();

        let report = run(&registry, &context(&root, 1), &[a]).unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(fs::read_to_string(root.join("build/a.txt")).unwrap(), "x");
    }

    #[test]
    fn test_failure_cancels_dependents_only() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 2);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let ok = write(&mut registry, &root, "ok", "x", runs.clone());
        let broken = registry
            .ensure(TaskKey::new("broken", ["z"]), |_| {
                Ok(TaskDef::file(root.join("build/broken.txt")).run(|_, ()| anyhow::bail!("tool exploded")))
            })
            .unwrap();
        let downstream = concat(&mut registry, &root, ok, broken, runs.clone());
        let sibling = write(&mut registry, &root, "sibling", "y", runs.clone());

        let report = run(&registry, &ctx, &[downstream, sibling]).unwrap();

        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, TaskKey::new("broken", ["z"]));
        assert!(report.was_cancelled(&TaskKey::new("concat", ["ab"])));
        assert!(report.was_executed(&TaskKey::new("write", ["sibling"])));
        assert!(report.was_executed(&TaskKey::new("write", ["ok"])));
    }

    #[test]
    fn test_missing_output_is_a_failure() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 1);

        let mut registry = Registry::new();
        let lazy = registry
            .ensure(TaskKey::new("lazy", ["x"]), |_| {
                Ok(TaskDef::file(root.join("build/never.txt")).run(|_, ()| Ok(())))
            })
            .unwrap();

        let report = run(&registry, &ctx, &[lazy]).unwrap();
        let (_, err) = &report.failed[0];
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingOutput { .. })
        ));
    }

    #[test]
    fn test_missing_source_is_a_failure() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 1);

        let mut registry = Registry::new();
        let task = registry
            .ensure(TaskKey::new("needs", ["x"]), |_| {
                Ok(TaskDef::phony()
                    .source(root.join("sources/absent.otf"))
                    .run(|_, ()| Ok(())))
            })
            .unwrap();

        let report = run(&registry, &ctx, &[task]).unwrap();
        assert!(matches!(
            report.failed[0].1.downcast_ref::<BuildError>(),
            Some(BuildError::MissingSource(_))
        ));
    }

    #[test]
    fn test_panic_is_reported() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 1);

        let mut registry = Registry::new();
        let task = registry
            .ensure(TaskKey::new("panics", ["x"]), |_| {
                Ok(TaskDef::phony().run(|_, ()| panic!("boom")))
            })
            .unwrap();

        let report = run(&registry, &ctx, &[task]).unwrap();
        assert!(report.failed[0].1.to_string().contains("boom"));
    }

    #[test]
    fn test_failure_is_not_journaled() {
        let (_dir, root) = scratch();
        let ctx = context(&root, 1);
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let counter = attempts.clone();
        let task = registry
            .ensure(TaskKey::new("flaky", ["x"]), |_| {
                Ok(TaskDef::phony().run(move |_, ()| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("no")
                }))
            })
            .unwrap();

        run(&registry, &ctx, &[task]).unwrap();
        run(&registry, &context(&root, 1), &[task]).unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
