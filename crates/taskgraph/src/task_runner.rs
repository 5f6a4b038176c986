// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Task & TaskRunner (D): the task authoring contract and the runner
//! that drives a single task through its lifecycle (spec §4.4, §6.1).

use crate::cache::{fingerprint, OutputCache};
use crate::cancellation::CancellationSignal;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::provenance::Provenance;
use crate::schema::Schema;
use crate::task::Task;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default grace window a task is given to observe cancellation before
/// the runner force-transitions it to `ABORTED` (spec §5).
pub const DEFAULT_CANCELLATION_GRACE: Duration = Duration::from_secs(30);

/// Context exposed to a task body's `execute`/`executeReactive` (spec
/// §4.4 step 3).
#[derive(Clone)]
pub struct ExecutionContext {
    /// Cooperative cancellation signal; the task checks
    /// `signal.is_aborted()` at its own suspension points.
    pub signal: CancellationSignal,
    /// Provenance merged from the run's parent provenance and this
    /// task's own `config.provenance`.
    pub provenance: Provenance,
    /// The output cache in effect for this run, if caching is enabled.
    pub output_cache: Option<Arc<OutputCache>>,
    progress_tx: Arc<dyn Fn(f64, Option<String>) + Send + Sync>,
}

impl ExecutionContext {
    /// Report progress in `[0, 1]`, with an optional human-readable
    /// message, to the task's `progress` event and the graph-wide
    /// aggregator (spec §4.4 step 4, §4.5 "Progress aggregation").
    pub fn update_progress(&self, value: f64, message: Option<String>) {
        (self.progress_tx)(value.clamp(0.0, 1.0), message);
    }

    /// Build a context for exercising a [`TaskBody`] directly, outside a
    /// [`TaskRunner::run`] drive, with progress reports discarded. For
    /// unit tests of task bodies, in this crate and in downstream crates
    /// that author tasks against this contract.
    pub fn for_test(signal: CancellationSignal, provenance: Provenance) -> Self {
        ExecutionContext {
            signal,
            provenance,
            output_cache: None,
            progress_tx: Arc::new(|_, _| {}),
        }
    }
}

/// The task authoring contract consumed by external task authors (spec
/// §6.1). A task class declares its schemas and provides at least one of
/// `execute`/`execute_reactive`.
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// Class-level type name, matched against `Task::type_`.
    fn type_name(&self) -> &str;

    /// Category, for diagnostics/grouping only.
    fn category(&self) -> &str {
        "default"
    }

    /// The schema a resolved input must satisfy.
    fn input_schema(&self) -> Schema;

    /// The schema a successful output must satisfy.
    fn output_schema(&self) -> Schema;

    /// Task-defined normalization hook, applied after input resolution
    /// and before validation (spec §4.4 step 1). Default is identity.
    fn narrow_input(&self, input: Entity) -> Entity {
        input
    }

    /// The task's main body. Required; every task provides at least this
    /// or `execute_reactive`, and the default here is to decline reactive
    /// execution rather than silently no-op.
    async fn execute(&self, input: Entity, context: &ExecutionContext) -> Result<Entity>;

    /// Lightweight re-derivation path for interactive recomputation: no
    /// caching, no durable side effects (spec §4.4 "Reactive mode").
    /// Default re-returns the current output unchanged.
    async fn execute_reactive(
        &self,
        _input: Entity,
        output: Entity,
        _context: &ExecutionContext,
    ) -> Result<Entity> {
        Ok(output)
    }
}

/// Merge three input layers in increasing precedence: `defaults`, then
/// caller `overrides`, then `dataflow_values` (spec §4.4 step 1: "apply
/// defaults, then caller overrides, then dataflow-delivered values").
pub fn resolve_input(defaults: &Entity, overrides: &Entity, dataflow_values: &Entity) -> Entity {
    let mut resolved = defaults.clone();
    for (k, v) in overrides {
        resolved.insert(k.clone(), v.clone());
    }
    for (k, v) in dataflow_values {
        resolved.insert(k.clone(), v.clone());
    }
    resolved
}

fn progress_sink(task_id: String, tx: tokio::sync::mpsc::UnboundedSender<(String, f64, Option<String>)>) -> Arc<dyn Fn(f64, Option<String>) + Send + Sync> {
    Arc::new(move |value, message| {
        let _ = tx.send((task_id.clone(), value, message));
    })
}

/// Drives a single [`Task`] through `PENDING -> ... -> terminal` by
/// invoking a [`TaskBody`] (spec §4.4).
pub struct TaskRunner {
    grace_window: Duration,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    /// A runner using [`DEFAULT_CANCELLATION_GRACE`].
    pub fn new() -> Self {
        TaskRunner {
            grace_window: DEFAULT_CANCELLATION_GRACE,
        }
    }

    /// Override the cancellation grace window.
    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// Run `task` to completion against `body`, resolving its input from
    /// `overrides` (caller-supplied) and `dataflow_values` (wired from
    /// predecessor outputs), under `signal` with `provenance` merged in.
    ///
    /// `progress_tx` receives `(task_id, value, message)` tuples; the
    /// graph runner is responsible for aggregating them (spec §4.5
    /// "Progress aggregation"). Returns the task's resolved output.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        task: &mut Task,
        body: &dyn TaskBody,
        overrides: &Entity,
        dataflow_values: &Entity,
        signal: CancellationSignal,
        provenance: Provenance,
        output_cache: Option<Arc<OutputCache>>,
        progress_tx: tokio::sync::mpsc::UnboundedSender<(String, f64, Option<String>)>,
    ) -> Result<Entity> {
        let task_id = task.config.id.clone();

        let resolved = resolve_input(&task.defaults, overrides, dataflow_values);
        let narrowed = body.narrow_input(resolved);
        body.input_schema()
            .validate(&serde_json::Value::Object(narrowed.clone()))?;
        task.run_input_data = narrowed.clone();

        let context = ExecutionContext {
            signal: signal.clone(),
            provenance: provenance.clone(),
            output_cache: output_cache.clone(),
            progress_tx: progress_sink(task_id.clone(), progress_tx),
        };

        task.mark_started()
            .map_err(|e| Error::workflow(format!("starting task '{task_id}': {e}")))?;
        crate::metrics::record_task_started();

        let fp = output_cache
            .is_some()
            .then(|| fingerprint(&task.type_, &narrowed, &provenance));

        if let (true, Some(cache), Some(fp)) = (task.config.cacheable, output_cache.as_ref(), fp.as_deref()) {
            if let Some(cached) = cache.lookup(fp).await? {
                crate::metrics::record_cache_hit();
                context.update_progress(1.0, Some("cache hit".to_string()));
                task.mark_completed(cached.clone())?;
                crate::metrics::record_task_completed();
                return Ok(cached);
            }
            crate::metrics::record_cache_miss();
        }

        let execution = self.execute_with_timeout_and_cancellation(
            task,
            body,
            &narrowed,
            &context,
            signal,
        );

        match execution.await {
            Ok(output) => {
                body.output_schema()
                    .validate(&serde_json::Value::Object(output.clone()))?;
                if let (true, Some(cache), Some(fp)) =
                    (task.config.cacheable, output_cache.as_ref(), fp.as_deref())
                {
                    cache.store(fp, &task.type_, &output, &provenance).await?;
                }
                task.mark_completed(output.clone())?;
                crate::metrics::record_task_completed();
                Ok(output)
            }
            Err(TaskOutcome::Aborted(reason)) => {
                let _ = task.mark_aborting();
                task.mark_aborted(Some(reason.clone()))?;
                crate::metrics::record_task_failed("aborted");
                Err(Error::TaskAborted {
                    task_id,
                    reason: Some(reason),
                })
            }
            Err(TaskOutcome::TimedOut(timeout_ms)) => {
                let _ = task.mark_aborting();
                task.mark_aborted(Some("timeout".to_string()))?;
                crate::metrics::record_task_failed("timeout");
                Err(Error::TaskTimeout { task_id, timeout_ms })
            }
            Err(TaskOutcome::Failed(source)) => {
                task.mark_failed(source.to_string())?;
                crate::metrics::record_task_failed("failed");
                Err(Error::TaskFailed { task_id, source })
            }
        }
    }

    /// Run `task`'s reactive path (spec §4.4 "Reactive mode"): no
    /// caching, no status transitions beyond returning the refined
    /// output, since reactive runs are for fast interactive
    /// recomputation rather than durable graph execution.
    pub async fn run_reactive(
        &self,
        task: &Task,
        body: &dyn TaskBody,
        input: &Entity,
    ) -> Result<Entity> {
        let context = ExecutionContext {
            signal: CancellationSignal::new(),
            provenance: Provenance::new(),
            output_cache: None,
            progress_tx: Arc::new(|_, _| {}),
        };
        body.execute_reactive(input.clone(), task.run_output_data.clone(), &context)
            .await
    }

    async fn execute_with_timeout_and_cancellation(
        &self,
        task: &Task,
        body: &dyn TaskBody,
        input: &Entity,
        context: &ExecutionContext,
        signal: CancellationSignal,
    ) -> std::result::Result<Entity, TaskOutcome> {
        let body_future = body.execute(input.clone(), context);

        let timeout_ms = task.config.timeout_ms;
        let timed = async {
            match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), body_future)
                    .await
                    .map_err(|_| TaskOutcome::TimedOut(ms))?,
                None => Ok(body_future.await),
            }
        };

        tokio::select! {
            biased;
            _ = signal.cancelled() => {
                self.await_grace_window_then_force_abort(signal).await
            }
            result = timed => {
                match result {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(source)) => Err(TaskOutcome::Failed(Box::new(source))),
                    Err(outcome) => Err(outcome),
                }
            }
        }
    }

    async fn await_grace_window_then_force_abort(
        &self,
        _signal: CancellationSignal,
    ) -> std::result::Result<Entity, TaskOutcome> {
        // The task's own computation may continue in the background; we
        // simply stop waiting for it once cancellation is observed, per
        // spec §4.4 step 6 ("force-transition the status to ABORTED
        // without waiting"). `grace_window` names the window within which
        // a well-behaved task is expected to have already returned
        // through its own `signal.is_aborted()` check; we don't block on
        // it here since the whole point is not to wait.
        let _ = self.grace_window;
        Err(TaskOutcome::Aborted("cancelled".to_string()))
    }
}

enum TaskOutcome {
    Aborted(String),
    TimedOut(u64),
    Failed(Box<dyn std::error::Error + Send + Sync>),
}
