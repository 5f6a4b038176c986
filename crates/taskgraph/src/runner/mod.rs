// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Graph Runner (E): the wave scheduler that runs a whole graph to
//! completion (spec §4.5).

pub mod merge;

use crate::cache::OutputCache;
use crate::cancellation::CancellationSignal;
use crate::dataflow::{Dataflow, WILDCARD_PORT};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::graph::{GraphEvent, TaskGraph};
use crate::provenance::{self, Provenance};
use crate::task::{Task, TaskStatus};
use crate::task_runner::{TaskBody, TaskRunner};
use futures::FutureExt;
use merge::{merge_writes, PortWrite};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

/// Task-type name -> task body implementation, supplied by the caller
/// (spec §1: "task authoring surface" is out of scope; the runner only
/// consumes this lookup).
pub type TaskBodyRegistry = HashMap<String, Arc<dyn TaskBody>>;

/// Configuration recognized by the Graph Runner (spec §6.5).
#[derive(Clone)]
pub struct RunnerOptions {
    /// Cancellation signal that aborts the run from outside.
    pub parent_signal: Option<CancellationSignal>,
    /// Record merged into each task's fingerprint.
    pub parent_provenance: Provenance,
    /// Repository used for memoization; `None` disables caching.
    pub output_cache: Option<Arc<OutputCache>>,
    /// Upper bound on concurrently-running tasks; `None` is unbounded.
    pub max_parallelism: Option<usize>,
    /// Fallback per-task timeout if a task does not declare one.
    pub default_task_timeout_ms: Option<u64>,
    /// If `false`, an erroring task does not cancel siblings in the same
    /// layer; successors of a failed task still never run. Default `true`.
    pub fail_fast: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            parent_signal: None,
            parent_provenance: Provenance::new(),
            output_cache: None,
            max_parallelism: None,
            default_task_timeout_ms: None,
            fail_fast: true,
        }
    }
}

/// One terminal task's contribution to a run's result (spec §4.5 step 6).
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// The terminal task's id.
    pub task_id: String,
    /// Its final output.
    pub data: Entity,
}

/// The ordered sequence of every terminal task's output (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct NamedGraphResult {
    /// One entry per terminal task, in task-id order.
    pub results: Vec<TaskResult>,
}

impl NamedGraphResult {
    /// `mergeExecuteOutputsToRunOutput`: fold every terminal task's output
    /// record into a single record, merging same-named fields across
    /// producers with `strategy` exactly as dataflow merges do (spec
    /// §4.5 step 6).
    pub fn merge_to_run_output(&self, strategy: merge::CompoundMerge) -> Entity {
        let mut by_field: HashMap<String, Vec<PortWrite>> = HashMap::new();
        for result in &self.results {
            for (field, value) in &result.data {
                by_field.entry(field.clone()).or_default().push(PortWrite {
                    producer_id: result.task_id.clone(),
                    value: value.clone(),
                });
            }
        }
        let mut merged = Entity::new();
        for (field, writes) in by_field {
            merged.insert(field, merge_writes(strategy, writes));
        }
        merged
    }
}

struct ProgressAggregator {
    weights: HashMap<String, f64>,
    progress: HashMap<String, f64>,
    last_emitted: Instant,
}

const PROGRESS_COALESCE_WINDOW: Duration = Duration::from_millis(30);

impl ProgressAggregator {
    fn new(graph: &TaskGraph) -> Self {
        let weights = graph
            .tasks()
            .iter()
            .map(|t| (t.config.id.clone(), t.config.weight))
            .collect();
        ProgressAggregator {
            weights,
            progress: HashMap::new(),
            last_emitted: Instant::now() - PROGRESS_COALESCE_WINDOW,
        }
    }

    fn aggregate(&self) -> f64 {
        let total_weight: f64 = self.weights.values().sum();
        if total_weight == 0.0 {
            return 1.0;
        }
        let sum: f64 = self
            .weights
            .iter()
            .map(|(id, weight)| weight * self.progress.get(id).copied().unwrap_or(0.0))
            .sum();
        sum / total_weight
    }

    /// Returns `Some(value)` when an event should be emitted now, honoring
    /// the ~30ms coalescing window (spec §4.5); `force` bypasses it for
    /// the final guaranteed 1.0.
    fn record(&mut self, task_id: &str, value: f64, force: bool) -> Option<f64> {
        self.progress.insert(task_id.to_string(), value);
        if force || self.last_emitted.elapsed() >= PROGRESS_COALESCE_WINDOW {
            self.last_emitted = Instant::now();
            Some(self.aggregate())
        } else {
            None
        }
    }
}

/// Per-task state prepared synchronously (while `&TaskGraph` is
/// borrowable) before the task is handed off to a concurrent future that
/// must not hold any borrow of the graph across an `.await`.
struct PreparedTask {
    task: Task,
    body: Arc<dyn TaskBody>,
    dataflow_values: Entity,
    overrides: Entity,
    provenance: Provenance,
}

/// Drives a whole [`TaskGraph`] through topological waves (spec §4.5).
pub struct GraphRunner {
    task_runner: TaskRunner,
}

impl Default for GraphRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphRunner {
    /// A runner using the default [`TaskRunner`].
    pub fn new() -> Self {
        GraphRunner {
            task_runner: TaskRunner::new(),
        }
    }

    fn resolve_dataflow_values(
        incoming: &[&Dataflow],
        outputs: &HashMap<String, Entity>,
        merge_strategy: merge::CompoundMerge,
    ) -> Entity {
        let mut named_writes: HashMap<String, Vec<PortWrite>> = HashMap::new();
        let mut wildcard_fills: Vec<(String, Entity)> = Vec::new();

        for df in incoming {
            let Some(output) = outputs.get(&df.source_task_id) else {
                continue;
            };
            let produced: Json = if df.source_port_id == WILDCARD_PORT {
                Json::Object(output.clone())
            } else {
                output.get(&df.source_port_id).cloned().unwrap_or(Json::Null)
            };
            if df.target_port_id == WILDCARD_PORT {
                if let Json::Object(map) = produced {
                    wildcard_fills.push((df.source_task_id.clone(), map));
                }
            } else {
                named_writes
                    .entry(df.target_port_id.clone())
                    .or_default()
                    .push(PortWrite {
                        producer_id: df.source_task_id.clone(),
                        value: produced,
                    });
            }
        }

        let mut resolved = Entity::new();
        for (port, writes) in named_writes {
            resolved.insert(port, merge_writes(merge_strategy, writes));
        }
        // Named-port writes take precedence on conflict; wildcard writes
        // only fill fields no named dataflow already wrote (spec §4.3).
        wildcard_fills.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, map) in wildcard_fills {
            for (k, v) in map {
                resolved.entry(k).or_insert(v);
            }
        }
        resolved
    }

    fn install_top_level_input(graph: &TaskGraph, task_id: &str, top_level_input: &Entity) -> Entity {
        let Some(task) = graph.get_task(task_id) else {
            return Entity::new();
        };
        let mut overrides = Entity::new();
        for (k, v) in top_level_input {
            if task.input_schema.properties.contains_key(k) {
                overrides.insert(k.clone(), v.clone());
            }
        }
        overrides
    }

    /// `run(graph, topLevelInput, opts)`: the top-level operation (spec
    /// §4.5). The graph is locked against structural mutation for the
    /// duration of the run (spec §5 "Shared-resource policy") and always
    /// unlocked again before returning, success or failure.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        registry: &TaskBodyRegistry,
        top_level_input: Entity,
        opts: RunnerOptions,
    ) -> Result<NamedGraphResult> {
        graph.topologically_sorted_nodes()?;
        let layers = graph.layers()?;

        graph.lock_for_run();
        let result = self.run_locked(graph, registry, top_level_input, opts, layers).await;
        graph.unlock();
        result
    }

    async fn run_locked(
        &self,
        graph: &mut TaskGraph,
        registry: &TaskBodyRegistry,
        top_level_input: Entity,
        opts: RunnerOptions,
        layers: Vec<Vec<String>>,
    ) -> Result<NamedGraphResult> {
        let run_started = Instant::now();
        let signal = opts.parent_signal.clone().unwrap_or_default();
        let semaphore = opts.max_parallelism.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut outputs: HashMap<String, Entity> = HashMap::new();
        let mut aggregator = ProgressAggregator::new(graph);
        let mut first_error: Option<Error> = None;
        let mut stopped_at_layer: Option<usize> = None;

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        // Intra-task `update_progress` calls are consumed here so a task
        // body's `ExecutionContext` always has somewhere to send; the
        // graph's aggregate progress (below) is driven by per-task
        // completion within a layer rather than these finer-grained
        // in-flight updates.
        let progress_drain = tokio::spawn(async move {
            while progress_rx.recv().await.is_some() {}
        });

        'layers: for (layer_index, layer) in layers.iter().enumerate() {
            if signal.is_aborted() {
                stopped_at_layer = Some(layer_index);
                break;
            }

            crate::metrics::record_layer_width(layer.len());

            let runnable_ids: Vec<&String> = layer
                .iter()
                .filter(|id| {
                    graph
                        .get_source_tasks(id)
                        .iter()
                        .all(|pred| outputs.contains_key(*pred))
                })
                .collect();
            for id in layer.iter().filter(|id| !runnable_ids.contains(id)) {
                debug!(task_id = %id, "skipping task: a predecessor did not produce output");
            }

            // Synchronous preparation phase: every read of `graph` and
            // every `take_task` happens here, before any `.await`, so no
            // future below ever holds a borrow of `graph` across a
            // suspension point (spec §5 "Shared-resource policy").
            let mut prepared: Vec<(String, PreparedTask)> = Vec::new();
            for task_id in runnable_ids {
                let Some(body) = registry.get(graph.get_task(task_id).map(|t| t.type_.as_str()).unwrap_or_default()).cloned() else {
                    first_error.get_or_insert_with(|| {
                        Error::workflow(format!("no task body registered for task '{task_id}'"))
                    });
                    continue;
                };

                let incoming = graph.get_source_dataflows(task_id);
                let merge_strategy = graph
                    .get_task(task_id)
                    .map(|t| t.config.compound_merge)
                    .unwrap_or_default();
                let dataflow_values = Self::resolve_dataflow_values(&incoming, &outputs, merge_strategy);
                let overrides = Self::install_top_level_input(graph, task_id, &top_level_input);
                let task_provenance = graph
                    .get_task(task_id)
                    .map(|t| provenance::merge(&opts.parent_provenance, &t.config.provenance))
                    .unwrap_or_else(|| opts.parent_provenance.clone());

                let Some(task) = graph.take_task(task_id) else {
                    continue;
                };
                prepared.push((
                    task_id.clone(),
                    PreparedTask {
                        task,
                        body,
                        dataflow_values,
                        overrides,
                        provenance: task_provenance,
                    },
                ));
            }

            let mut running = Vec::with_capacity(prepared.len());
            for (task_id, prepared_task) in prepared {
                let permit = match &semaphore {
                    Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore not closed")),
                    None => None,
                };
                let task_runner = TaskRunner::new();
                let signal = signal.clone();
                let output_cache = opts.output_cache.clone();
                let progress_tx = progress_tx.clone();
                let span = info_span!("task_run", task_id = %task_id);
                running.push(tokio::spawn(
                    Self::drive_task(task_runner, prepared_task, signal, output_cache, progress_tx)
                        .instrument(span)
                        .map({
                            move |out| {
                                drop(permit);
                                out
                            }
                        }),
                ));
            }

            for handle in running {
                let (task_id, task, outcome) = handle
                    .await
                    .map_err(|e| Error::workflow(format!("task join error: {e}")))?;
                graph.restore_task(task);
                match outcome {
                    Ok(output) => {
                        outputs.insert(task_id, output);
                    }
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "task did not complete successfully");
                        let is_failure = err.is_task_failed();
                        let supersedes = match &first_error {
                            None => true,
                            Some(existing) => is_failure && !existing.is_task_failed(),
                        };
                        if supersedes {
                            first_error = Some(err);
                        }
                        if opts.fail_fast {
                            signal.cancel();
                        }
                    }
                }
            }

            for task_id in layer {
                if outputs.contains_key(task_id) {
                    if let Some(value) = aggregator.record(task_id, 1.0, false) {
                        graph.events().emit(GraphEvent::GraphProgress(value));
                    }
                }
            }

            if opts.fail_fast && (first_error.is_some() || signal.is_aborted()) {
                stopped_at_layer = Some(layer_index + 1);
                break 'layers;
            }
        }

        // Every task in a layer that was never reached (because the
        // run stopped early, or a predecessor never produced output)
        // transitions to SKIPPED if it is still PENDING (spec §4.5, §5:
        // "tasks that have not yet started transition to SKIPPED").
        let from_layer = stopped_at_layer.unwrap_or(layers.len());
        for layer in layers.iter().skip(from_layer.min(layers.len())) {
            for task_id in layer {
                Self::mark_skipped_if_pending(graph, task_id);
            }
        }
        for layer in &layers {
            for task_id in layer {
                if !outputs.contains_key(task_id) {
                    Self::mark_skipped_if_pending(graph, task_id);
                }
            }
        }

        graph.events().emit(GraphEvent::GraphProgress(1.0));
        drop(progress_tx);
        let _ = progress_drain.await;
        crate::metrics::record_graph_run_seconds(run_started.elapsed().as_secs_f64());

        if let Some(err) = first_error {
            return Err(err);
        }

        let mut results: Vec<TaskResult> = graph
            .terminal_task_ids()
            .into_iter()
            .filter_map(|id| outputs.get(id).map(|data| TaskResult { task_id: id.to_string(), data: data.clone() }))
            .collect();
        results.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(NamedGraphResult { results })
    }

    fn mark_skipped_if_pending(graph: &mut TaskGraph, task_id: &str) {
        if let Some(task) = graph.get_task_mut(task_id) {
            if task.status == TaskStatus::Pending {
                let _ = task.mark_skipped();
            }
        }
    }

    async fn drive_task(
        task_runner: TaskRunner,
        mut prepared: PreparedTask,
        signal: CancellationSignal,
        output_cache: Option<Arc<OutputCache>>,
        progress_tx: tokio::sync::mpsc::UnboundedSender<(String, f64, Option<String>)>,
    ) -> (String, Task, Result<Entity>) {
        let task_id = prepared.task.config.id.clone();
        let result = task_runner
            .run(
                &mut prepared.task,
                prepared.body.as_ref(),
                &prepared.overrides,
                &prepared.dataflow_values,
                signal,
                prepared.provenance,
                output_cache,
                progress_tx,
            )
            .await;
        (task_id, prepared.task, result)
    }

    /// `runReactive(graph)`: runs every task's reactive path in
    /// topological order, without caching or job-queue invocation (spec
    /// §4.5 "Reactive run").
    pub async fn run_reactive(
        &self,
        graph: &TaskGraph,
        registry: &TaskBodyRegistry,
    ) -> Result<NamedGraphResult> {
        let order = graph.topologically_sorted_nodes()?;
        let mut results = Vec::new();
        for task_id in order {
            let Some(task) = graph.get_task(task_id) else {
                continue;
            };
            let Some(body) = registry.get(&task.type_) else {
                continue;
            };
            let output = self
                .task_runner
                .run_reactive(task, body.as_ref(), &task.run_input_data)
                .await?;
            if graph.get_target_dataflows(task_id).is_empty() {
                results.push(TaskResult {
                    task_id: task_id.to_string(),
                    data: output,
                });
            }
        }
        Ok(NamedGraphResult { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertySchema, PropertyType, Schema};
    use crate::task::TaskConfig;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn int_schema(name: &str) -> Schema {
        let mut props = BTreeMap::new();
        props.insert(name.to_string(), PropertySchema::new(PropertyType::Integer));
        Schema::new(props, [name.to_string()].into()).unwrap()
    }

    struct Square;
    #[async_trait]
    impl TaskBody for Square {
        fn type_name(&self) -> &str {
            "TestSquare"
        }
        fn input_schema(&self) -> Schema {
            int_schema("input")
        }
        fn output_schema(&self) -> Schema {
            int_schema("output")
        }
        async fn execute(&self, input: Entity, _ctx: &crate::task_runner::ExecutionContext) -> Result<Entity> {
            let n = input.get("input").and_then(Json::as_i64).unwrap_or(0);
            let mut out = Entity::new();
            out.insert("output".to_string(), serde_json::json!(n * n));
            Ok(out)
        }
    }

    struct Double;
    #[async_trait]
    impl TaskBody for Double {
        fn type_name(&self) -> &str {
            "TestDouble"
        }
        fn input_schema(&self) -> Schema {
            int_schema("input")
        }
        fn output_schema(&self) -> Schema {
            int_schema("output")
        }
        async fn execute(&self, input: Entity, _ctx: &crate::task_runner::ExecutionContext) -> Result<Entity> {
            let n = input.get("input").and_then(Json::as_i64).unwrap_or(0);
            let mut out = Entity::new();
            out.insert("output".to_string(), serde_json::json!(n * 2));
            Ok(out)
        }
    }

    fn task(id: &str, type_: &str, input_default: Option<i64>) -> Task {
        let mut defaults = Entity::new();
        if let Some(n) = input_default {
            defaults.insert("input".to_string(), serde_json::json!(n));
        }
        Task::new(
            type_,
            TaskConfig::new(id),
            int_schema("input"),
            int_schema("output"),
            defaults,
        )
    }

    /// Scenario E1: `A(TestSquare, input=5) -> B(TestDouble)`.
    #[tokio::test]
    async fn square_then_double_pipeline() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("A", "TestSquare", Some(5))).unwrap();
        graph.add_task(task("B", "TestDouble", None)).unwrap();
        graph.add_dataflow(Dataflow::new("A", "output", "B", "input")).unwrap();

        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert("TestSquare".to_string(), Arc::new(Square));
        registry.insert("TestDouble".to_string(), Arc::new(Double));

        let runner = GraphRunner::new();
        let result = runner
            .run(&mut graph, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].task_id, "B");
        assert_eq!(result.results[0].data.get("output").unwrap(), &serde_json::json!(50));

        let merged = result.merge_to_run_output(merge::CompoundMerge::LastOrPropertyArray);
        assert_eq!(merged.get("output").unwrap(), &serde_json::json!(50));

        assert_eq!(graph.get_task("A").unwrap().status, TaskStatus::Completed);
        assert_eq!(graph.get_task("B").unwrap().status, TaskStatus::Completed);
    }

    /// Scenario E2: diamond, `A -> B` and `A -> C`, no sink join.
    #[tokio::test]
    async fn diamond_with_property_array_merge() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("A", "TestSquare", Some(5))).unwrap();
        graph.add_task(task("B", "TestSquare", None)).unwrap();
        graph.add_task(task("C", "TestDouble", None)).unwrap();
        graph.add_dataflow(Dataflow::new("A", "output", "B", "input")).unwrap();
        graph.add_dataflow(Dataflow::new("A", "output", "C", "input")).unwrap();

        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert("TestSquare".to_string(), Arc::new(Square));
        registry.insert("TestDouble".to_string(), Arc::new(Double));

        let runner = GraphRunner::new();
        let result = runner
            .run(&mut graph, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap();

        let mut ids: Vec<&str> = result.results.iter().map(|r| r.task_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["B", "C"]);

        let merged = result.merge_to_run_output(merge::CompoundMerge::PropertyArray);
        let values: Vec<i64> = merged
            .get("output")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![25, 10]);
    }

    struct Failing;
    #[async_trait]
    impl TaskBody for Failing {
        fn type_name(&self) -> &str {
            "FailingTask"
        }
        fn input_schema(&self) -> Schema {
            Schema::new(BTreeMap::new(), Default::default()).unwrap()
        }
        fn output_schema(&self) -> Schema {
            Schema::new(BTreeMap::new(), Default::default()).unwrap()
        }
        async fn execute(&self, _input: Entity, _ctx: &crate::task_runner::ExecutionContext) -> Result<Entity> {
            Err(Error::workflow("boom"))
        }
    }

    struct LongRunning;
    #[async_trait]
    impl TaskBody for LongRunning {
        fn type_name(&self) -> &str {
            "LongRunningTask"
        }
        fn input_schema(&self) -> Schema {
            Schema::new(BTreeMap::new(), Default::default()).unwrap()
        }
        fn output_schema(&self) -> Schema {
            Schema::new(BTreeMap::new(), Default::default()).unwrap()
        }
        async fn execute(&self, _input: Entity, ctx: &crate::task_runner::ExecutionContext) -> Result<Entity> {
            ctx.signal.cancelled().await;
            Err(Error::workflow("cancelled before completion"))
        }
    }

    /// Scenario E4: first-failure cancels siblings still in flight.
    #[tokio::test]
    async fn first_failure_cancels_running_siblings() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("A", "TestSquare", Some(5))).unwrap();
        graph
            .add_task(Task::new(
                "FailingTask",
                TaskConfig::new("F"),
                Schema::new(BTreeMap::new(), Default::default()).unwrap(),
                Schema::new(BTreeMap::new(), Default::default()).unwrap(),
                Entity::new(),
            ))
            .unwrap();
        graph
            .add_task(Task::new(
                "LongRunningTask",
                TaskConfig::new("G"),
                Schema::new(BTreeMap::new(), Default::default()).unwrap(),
                Schema::new(BTreeMap::new(), Default::default()).unwrap(),
                Entity::new(),
            ))
            .unwrap();
        graph.add_dataflow(Dataflow::new("A", "output", "F", "*")).unwrap();
        graph.add_dataflow(Dataflow::new("A", "output", "G", "*")).unwrap();

        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert("TestSquare".to_string(), Arc::new(Square));
        registry.insert("FailingTask".to_string(), Arc::new(Failing));
        registry.insert("LongRunningTask".to_string(), Arc::new(LongRunning));

        let runner = GraphRunner::new();
        let err = runner
            .run(&mut graph, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
        assert_eq!(graph.get_task("A").unwrap().status, TaskStatus::Completed);
        assert_eq!(graph.get_task("F").unwrap().status, TaskStatus::Failed);
        assert!(matches!(
            graph.get_task("G").unwrap().status,
            TaskStatus::Aborted | TaskStatus::Aborting
        ));
    }

    /// Property 3 surrogate: a graph not yet unlocked after `run` rejects
    /// mutation, and is unlocked again once `run` returns.
    #[tokio::test]
    async fn graph_is_unlocked_after_run_completes() {
        let mut graph = TaskGraph::new();
        graph.add_task(task("A", "TestSquare", Some(2))).unwrap();
        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert("TestSquare".to_string(), Arc::new(Square));
        let runner = GraphRunner::new();
        runner
            .run(&mut graph, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap();
        assert!(graph.add_task(task("B", "TestDouble", None)).is_ok());
    }

    struct CountingSquare {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }
    #[async_trait]
    impl TaskBody for CountingSquare {
        fn type_name(&self) -> &str {
            "TestSquare"
        }
        fn input_schema(&self) -> Schema {
            int_schema("input")
        }
        fn output_schema(&self) -> Schema {
            int_schema("output")
        }
        async fn execute(&self, input: Entity, _ctx: &crate::task_runner::ExecutionContext) -> Result<Entity> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let n = input.get("input").and_then(Json::as_i64).unwrap_or(0);
            let mut out = Entity::new();
            out.insert("output".to_string(), serde_json::json!(n * n));
            Ok(out)
        }
    }

    /// Scenario E3: a second run with the same inputs hits the output
    /// cache and does not invoke `execute` again.
    #[tokio::test]
    async fn second_run_hits_output_cache() {
        let repo: Arc<dyn crate::repository::Repository> = Arc::new(
            crate::repository::MemoryRepository::new(
                crate::cache::cache_schema(),
                crate::cache::cache_primary_key_names(),
                vec![],
            ),
        );
        let cache = Arc::new(OutputCache::new(repo));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert(
            "TestSquare".to_string(),
            Arc::new(CountingSquare { calls: calls.clone() }),
        );
        registry.insert("TestDouble".to_string(), Arc::new(Double));

        let options = RunnerOptions {
            output_cache: Some(cache),
            ..RunnerOptions::default()
        };

        for _ in 0..2 {
            let mut graph = TaskGraph::new();
            graph.add_task(task("A", "TestSquare", Some(5))).unwrap();
            graph.add_task(task("B", "TestDouble", None)).unwrap();
            graph.add_dataflow(Dataflow::new("A", "output", "B", "input")).unwrap();
            let runner = GraphRunner::new();
            let result = runner
                .run(&mut graph, &registry, Entity::new(), options.clone())
                .await
                .unwrap();
            assert_eq!(result.results[0].data.get("output").unwrap(), &serde_json::json!(50));
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Scenario E6: serializing a graph to JSON and rebuilding a fresh
    /// graph from it produces equal `NamedGraphResult`s.
    #[tokio::test]
    async fn graph_survives_json_round_trip() {
        let mut registry: TaskBodyRegistry = HashMap::new();
        registry.insert("TestSquare".to_string(), Arc::new(Square));
        registry.insert("TestDouble".to_string(), Arc::new(Double));
        let schema_of = |type_: &str| -> Option<(Schema, Schema)> {
            registry
                .get(type_)
                .map(|body| (body.input_schema(), body.output_schema()))
        };

        let mut original = TaskGraph::new();
        original.add_task(task("A", "TestSquare", Some(5))).unwrap();
        original.add_task(task("B", "TestDouble", None)).unwrap();
        original.add_dataflow(Dataflow::new("A", "output", "B", "input")).unwrap();

        let wire = original.to_json();
        let mut rebuilt = TaskGraph::from_graph_json(&wire, &schema_of).unwrap();

        let runner = GraphRunner::new();
        let original_result = runner
            .run(&mut original, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap();
        let rebuilt_result = runner
            .run(&mut rebuilt, &registry, Entity::new(), RunnerOptions::default())
            .await
            .unwrap();

        assert_eq!(original_result.results.len(), rebuilt_result.results.len());
        assert_eq!(
            original_result.results[0].data.get("output"),
            rebuilt_result.results[0].data.get("output"),
        );
    }
}
