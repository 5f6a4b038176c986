// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Task: the lifecycle state machine and static configuration for a
//! single node in a [`crate::graph::TaskGraph`] (spec §3.1, §4.4).

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::graph::TaskGraph;
use crate::provenance::Provenance;
use crate::runner::merge::CompoundMerge;
use crate::schema::Schema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// `PENDING -> PROCESSING -> (COMPLETED | FAILED | ABORTED | SKIPPED)`,
/// with an intermediate `ABORTING` entered on cancellation (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not yet dispatched.
    Pending,
    /// `execute`/`executeReactive` is running.
    Processing,
    /// Cancellation observed; waiting for the task to terminate or for the
    /// grace window to elapse.
    Aborting,
    /// `execute` returned successfully.
    Completed,
    /// `execute` threw an error other than the canonical "aborted" error.
    Failed,
    /// The task observed cancellation (or the grace window elapsed first).
    Aborted,
    /// Explicitly skipped before the wave released it.
    Skipped,
}

impl TaskStatus {
    /// True once the task will never transition again without an explicit
    /// `reset` (spec §3.1: "progress is monotonic within a run").
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted | TaskStatus::Skipped
        )
    }

    fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Skipped)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Aborting)
                | (Aborting, Aborted)
                | (Aborting, Completed)
                | (Aborting, Failed)
        )
    }
}

/// Static, caller-declared configuration for a task (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Stable identifier, unique within its owning graph.
    pub id: String,
    /// Human-readable name, for diagnostics only.
    pub name: Option<String>,
    /// Contributes to the cache fingerprint alongside the run's parent
    /// provenance (spec §4.4 step 2).
    pub provenance: Provenance,
    /// Caller-opaque extra data, carried through serialization untouched.
    pub extras: Option<Json>,
    /// Name of the durable job queue this task should be routed through,
    /// if any (spec §1: job queue transport is an external collaborator).
    pub queue_name: Option<String>,
    /// Whether this task's output may be memoized in the output cache.
    /// Defaults to `true` for a plain task, `false` for a `GraphAsTask`
    /// with children (spec §9 open question (ii)).
    pub cacheable: bool,
    /// Strategy for merging values from multiple producers onto the same
    /// input port (spec §4.5).
    pub compound_merge: CompoundMerge,
    /// Relative contribution to aggregate graph progress (spec §4.5);
    /// defaults to `1.0`.
    pub weight: f64,
    /// Optional per-task timeout; falls back to
    /// `RunnerOptions::default_task_timeout_ms` if unset (spec §5).
    pub timeout_ms: Option<u64>,
}

impl TaskConfig {
    /// A minimal config for `id` with every optional field at its default.
    pub fn new(id: impl Into<String>) -> Self {
        TaskConfig {
            id: id.into(),
            name: None,
            provenance: Provenance::new(),
            extras: None,
            queue_name: None,
            cacheable: true,
            compound_merge: CompoundMerge::LastOrPropertyArray,
            weight: 1.0,
            timeout_ms: None,
        }
    }
}

/// A unit of work in a [`TaskGraph`] (spec §3.1).
///
/// Deliberately not `Clone`/`Debug`/`Serialize`-derived: a task with a
/// `sub_graph` owns a whole nested [`TaskGraph`] (event bus, run-lock and
/// all), which is not a value type. [`crate::graph::TaskGraph::to_json`]
/// builds the wire form field-by-field instead of deriving `Serialize`
/// on the whole struct.
pub struct Task {
    /// Class-level type name (e.g. `"TestSquare"`).
    pub type_: String,
    /// Static configuration.
    pub config: TaskConfig,
    /// Schema the resolved input must satisfy.
    pub input_schema: Schema,
    /// Schema a successful `execute`/`executeReactive` output must satisfy.
    pub output_schema: Schema,
    /// Starting input; `run_input_data` is a deep clone of this at
    /// construction and before every `reset`.
    pub defaults: Entity,
    /// Input as resolved for the current/most recent run.
    pub run_input_data: Entity,
    /// Output as produced by the current/most recent run.
    pub run_output_data: Entity,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Progress in `[0, 1]`, monotonic within a run.
    pub progress: f64,
    /// Construction time.
    pub created_at: DateTime<Utc>,
    /// Time `PENDING -> PROCESSING` was observed.
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last recorded error, if the task ended `FAILED` or `ABORTED`.
    pub error: Option<String>,
    /// A task graph this task delegates to, if it is a `GraphAsTask`
    /// (spec §4.3 "Subgraphs").
    pub sub_graph: Option<Box<TaskGraph>>,
}

impl Task {
    /// Construct a new, `PENDING` task with `run_input_data` initialized
    /// from `defaults`.
    pub fn new(
        type_: impl Into<String>,
        config: TaskConfig,
        input_schema: Schema,
        output_schema: Schema,
        defaults: Entity,
    ) -> Self {
        let run_input_data = defaults.clone();
        Task {
            type_: type_.into(),
            config,
            input_schema,
            output_schema,
            defaults,
            run_input_data,
            run_output_data: Entity::new(),
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            sub_graph: None,
        }
    }

    /// Attach a subgraph, turning this task into a `GraphAsTask`. Per
    /// spec §9 open question (ii), a task with a non-empty subgraph
    /// defaults to non-cacheable unless the caller opted in explicitly.
    pub fn with_sub_graph(mut self, sub_graph: TaskGraph) -> Self {
        if !sub_graph.tasks().is_empty() {
            self.config.cacheable = false;
        }
        self.sub_graph = Some(Box::new(sub_graph));
        self
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::workflow(format!(
                "task '{}' cannot transition {:?} -> {:?}",
                self.config.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// `PENDING -> PROCESSING`. Sets `started_at`.
    pub fn mark_started(&mut self) -> Result<()> {
        self.transition(TaskStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `PROCESSING -> COMPLETED` (or `ABORTING -> COMPLETED` if the task
    /// raced a cancellation signal but still returned successfully).
    pub fn mark_completed(&mut self, output: Entity) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.run_output_data = output;
        self.progress = 1.0;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `PROCESSING -> FAILED`.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `PROCESSING -> ABORTING`: cancellation observed, execution still
    /// draining.
    pub fn mark_aborting(&mut self) -> Result<()> {
        self.transition(TaskStatus::Aborting)
    }

    /// `ABORTING -> ABORTED`.
    pub fn mark_aborted(&mut self, reason: Option<String>) -> Result<()> {
        self.transition(TaskStatus::Aborted)?;
        self.error = reason;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Explicit skip before the wave releases this task.
    pub fn mark_skipped(&mut self) -> Result<()> {
        self.transition(TaskStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Reset to `PENDING`, restoring `run_input_data` from `defaults` and
    /// clearing run-scoped fields. The only way to leave a terminal state.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.run_input_data = self.defaults.clone();
        self.run_output_data = Entity::new();
        self.progress = 0.0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
    }

    /// This task has no outgoing dataflows in `graph` — a terminal node
    /// whose output contributes to the graph's `NamedGraphResult`.
    pub fn is_terminal_in(&self, graph: &TaskGraph) -> bool {
        graph.get_target_dataflows(&self.config.id).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertySchema, PropertyType};
    use std::collections::BTreeMap;

    fn empty_schema() -> Schema {
        Schema::new(BTreeMap::new(), Default::default()).unwrap()
    }

    fn sample_task() -> Task {
        let mut defaults = Entity::new();
        defaults.insert("input".to_string(), serde_json::json!(5));
        let mut props = BTreeMap::new();
        props.insert("input".to_string(), PropertySchema::new(PropertyType::Integer));
        let input_schema = Schema::new(props, Default::default()).unwrap();
        Task::new(
            "TestSquare",
            TaskConfig::new("A"),
            input_schema,
            empty_schema(),
            defaults,
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut task = sample_task();
        assert_eq!(task.status, TaskStatus::Pending);
        task.mark_started().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(25));
        task.mark_completed(out).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn cannot_skip_completed_straight_to_processing_again() {
        let mut task = sample_task();
        task.mark_started().unwrap();
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(25));
        task.mark_completed(out).unwrap();
        assert!(task.mark_started().is_err());
    }

    #[test]
    fn reset_restores_defaults_and_pending() {
        let mut task = sample_task();
        task.mark_started().unwrap();
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(25));
        task.mark_completed(out).unwrap();
        task.reset();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.run_input_data, task.defaults);
        assert_eq!(task.progress, 0.0);
    }

    #[test]
    fn abort_path() {
        let mut task = sample_task();
        task.mark_started().unwrap();
        task.mark_aborting().unwrap();
        task.mark_aborted(Some("timeout".to_string())).unwrap();
        assert_eq!(task.status, TaskStatus::Aborted);
        assert_eq!(task.error.as_deref(), Some("timeout"));
    }
}
