// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error taxonomy for the task-graph engine (spec §7).
//!
//! `WorkflowError` and `InvalidInput` are returned synchronously at their
//! discovery point and are never wrapped by [`Error::TaskFailed`] or
//! [`Error::TaskAborted`]; the graph runner re-throws the first
//! `TaskFailed` it observes, or else a `TaskAborted`, per the fail-fast
//! policy in spec §4.5/§7.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The engine's error taxonomy. Kinds, not language-specific exception
/// classes: every backend and component maps its own failures into one of
/// these variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A record failed schema validation. Carries every offending path,
    /// not just the first (spec §4.1).
    #[error("invalid input: {paths:?}")]
    InvalidInput {
        /// JSON-pointer-ish paths of every field that failed validation.
        paths: Vec<String>,
    },

    /// A task's body threw. Wraps the underlying cause.
    #[error("task '{task_id}' failed: {source}")]
    TaskFailed {
        /// Id of the task whose `execute` returned this error.
        task_id: String,
        /// The underlying cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A task observed cancellation and stopped before completing.
    #[error("task '{task_id}' aborted{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    TaskAborted {
        /// Id of the task that was aborted.
        task_id: String,
        /// Optional reason (e.g. "timeout", "parent cancelled").
        reason: Option<String>,
    },

    /// A task's `config.timeout_ms` elapsed before `execute` returned.
    /// Surfaced as an aborted task with a `timeout` cause tag (spec §7).
    #[error("task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// Id of the task that timed out.
        task_id: String,
        /// The configured timeout, in milliseconds.
        timeout_ms: u64,
    },

    /// Structural error in building or running a graph: missing port,
    /// unknown task id, cycle, no suitable index, graph mutated mid-run.
    #[error("workflow error: {0}")]
    WorkflowError(String),

    /// Backend-specific storage failure, wrapping the native error.
    #[error("repository error: {0}")]
    RepositoryError(String),

    /// The backend does not implement the requested operation.
    #[error("unsupported operation on this backend: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Construct an `InvalidInput` error from a single offending path.
    pub fn invalid_input(path: impl Into<String>) -> Self {
        Error::InvalidInput {
            paths: vec![path.into()],
        }
    }

    /// Construct a `WorkflowError` from a message.
    pub fn workflow(message: impl Into<String>) -> Self {
        Error::WorkflowError(message.into())
    }

    /// Construct a `RepositoryError` from a message.
    pub fn repository(message: impl Into<String>) -> Self {
        Error::RepositoryError(message.into())
    }

    /// True if this error is (or wraps) a `TaskFailed`. Used by the graph
    /// runner to prefer a failure over a mere abort when both occurred
    /// (spec §4.5: "a task failure is the root cause; the abort is a
    /// consequence").
    pub fn is_task_failed(&self) -> bool {
        matches!(self, Error::TaskFailed { .. })
    }
}
