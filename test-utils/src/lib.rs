// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shared fixtures for `taskgraph`'s test suites: schema-building
//! helpers, a configurable [`MockTask`] body with a builder
//! (handler/fixed-response/call-history/call-count/fail-next knobs), and
//! a small set of named task bodies (`TestSquare`, `TestDouble`,
//! `TestAdd`, `FailingTask`, `LongRunningTask`) exercised by the Scenario
//! E1-E6 tests described alongside the Graph Runner.

use async_trait::async_trait;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use taskgraph::entity::Entity;
use taskgraph::error::{Error, Result};
use taskgraph::schema::{PropertySchema, PropertyType, Schema};
use taskgraph::task_runner::{ExecutionContext, TaskBody};

/// A single-property `{name: integer}` schema, the shape every scalar
/// fixture task in this crate reads and writes.
pub fn int_schema(name: &str) -> Schema {
    let mut properties = BTreeMap::new();
    properties.insert(name.to_string(), PropertySchema::new(PropertyType::Integer));
    Schema::new(properties, Default::default()).expect("int_schema is always valid")
}

/// The empty schema, for fixture tasks that take or produce no fields.
pub fn empty_schema() -> Schema {
    Schema::new(BTreeMap::new(), Default::default()).expect("empty schema is always valid")
}

/// Handler function type for [`MockTask`]'s `execute`.
pub type MockTaskHandler = Arc<dyn Fn(&Entity) -> Result<Entity> + Send + Sync>;

/// A configurable mock [`TaskBody`] for tests that need to observe how a
/// graph run invokes a task, not just what the task computes.
///
/// # Example
///
/// ```rust,ignore
/// use taskgraph_test_utils::{MockTask, int_schema};
///
/// let task = MockTask::new("Double")
///     .with_schemas(int_schema("input"), int_schema("output"))
///     .with_handler(|input| {
///         let n = input.get("input").and_then(serde_json::Value::as_i64).unwrap_or(0);
///         let mut out = taskgraph::Entity::new();
///         out.insert("output".to_string(), serde_json::json!(n * 2));
///         Ok(out)
///     });
/// ```
#[derive(Clone)]
pub struct MockTask {
    type_name: String,
    category: String,
    input_schema: Schema,
    output_schema: Schema,
    handler: Option<MockTaskHandler>,
    fixed_output: Entity,
    call_history: Arc<Mutex<Vec<Entity>>>,
    call_count: Arc<Mutex<usize>>,
    should_fail: Arc<Mutex<bool>>,
    error_message: String,
    wait_for_cancellation: bool,
}

impl std::fmt::Debug for MockTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTask")
            .field("type_name", &self.type_name)
            .field("call_count", &self.call_count())
            .finish()
    }
}

impl MockTask {
    /// Create a new mock task body named `type_name`, with empty
    /// input/output schemas until overridden via [`Self::with_schemas`].
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            category: "mock".to_string(),
            input_schema: empty_schema(),
            output_schema: empty_schema(),
            handler: None,
            fixed_output: Entity::new(),
            call_history: Arc::new(Mutex::new(Vec::new())),
            call_count: Arc::new(Mutex::new(0)),
            should_fail: Arc::new(Mutex::new(false)),
            error_message: "mock task failure".to_string(),
            wait_for_cancellation: false,
        }
    }

    /// Override the declared input/output schemas.
    pub fn with_schemas(mut self, input: Schema, output: Schema) -> Self {
        self.input_schema = input;
        self.output_schema = output;
        self
    }

    /// Set the diagnostic category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Compute output from a handler instead of a fixed value.
    pub fn with_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entity) -> Result<Entity> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(f));
        self
    }

    /// Always return `output`, unless a handler is set.
    pub fn with_output(mut self, output: Entity) -> Self {
        self.fixed_output = output;
        self
    }

    /// Make `execute` block on `context.signal.cancelled()` instead of
    /// returning, for Scenario E4's "first failure cancels running
    /// siblings" exercises.
    pub fn waiting_for_cancellation(mut self) -> Self {
        self.wait_for_cancellation = true;
        self
    }

    /// Fail the next call with `error_message`, then resume succeeding.
    pub fn fail_next(&self) {
        *self.should_fail.lock().unwrap() = true;
    }

    /// Override the message used by `fail_next`.
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Number of times `execute` has been invoked.
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Every input this task has been invoked with, in call order.
    pub fn call_history(&self) -> Vec<Entity> {
        self.call_history.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskBody for MockTask {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn input_schema(&self) -> Schema {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> Schema {
        self.output_schema.clone()
    }

    async fn execute(&self, input: Entity, context: &ExecutionContext) -> Result<Entity> {
        *self.call_count.lock().unwrap() += 1;
        self.call_history.lock().unwrap().push(input.clone());

        {
            let mut should_fail = self.should_fail.lock().unwrap();
            if *should_fail {
                *should_fail = false;
                return Err(Error::workflow(self.error_message.clone()));
            }
        }

        if self.wait_for_cancellation {
            context.signal.cancelled().await;
            return Err(Error::workflow("cancelled before completion"));
        }

        match &self.handler {
            Some(handler) => handler(&input),
            None => Ok(self.fixed_output.clone()),
        }
    }
}

/// A builder for [`MockTask`]s with specific behaviors, kept separate
/// from `MockTask` itself so call-site code reads as a declaration of
/// intent rather than a sequence of mutations.
pub struct MockTaskBuilder {
    task: MockTask,
}

impl MockTaskBuilder {
    /// Start building a mock task named `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            task: MockTask::new(type_name),
        }
    }

    /// See [`MockTask::with_schemas`].
    pub fn schemas(mut self, input: Schema, output: Schema) -> Self {
        self.task = self.task.with_schemas(input, output);
        self
    }

    /// See [`MockTask::with_handler`].
    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entity) -> Result<Entity> + Send + Sync + 'static,
    {
        self.task = self.task.with_handler(f);
        self
    }

    /// See [`MockTask::with_output`].
    pub fn output(mut self, output: Entity) -> Self {
        self.task = self.task.with_output(output);
        self
    }

    /// See [`MockTask::waiting_for_cancellation`].
    pub fn waits_for_cancellation(mut self) -> Self {
        self.task = self.task.waiting_for_cancellation();
        self
    }

    /// Build the [`MockTask`].
    pub fn build(self) -> MockTask {
        self.task
    }
}

fn int_input(input: &Entity, key: &str) -> i64 {
    input.get(key).and_then(Json::as_i64).unwrap_or(0)
}

/// `{input: int} -> {output: input^2}`. Used across the Graph Runner's
/// Scenario E1/E2 fixtures.
pub struct TestSquare;

#[async_trait]
impl TaskBody for TestSquare {
    fn type_name(&self) -> &str {
        "TestSquare"
    }
    fn input_schema(&self) -> Schema {
        int_schema("input")
    }
    fn output_schema(&self) -> Schema {
        int_schema("output")
    }
    async fn execute(&self, input: Entity, _context: &ExecutionContext) -> Result<Entity> {
        let n = int_input(&input, "input");
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(n * n));
        Ok(out)
    }
}

/// `{input: int} -> {output: 2 * input}`.
pub struct TestDouble;

#[async_trait]
impl TaskBody for TestDouble {
    fn type_name(&self) -> &str {
        "TestDouble"
    }
    fn input_schema(&self) -> Schema {
        int_schema("input")
    }
    fn output_schema(&self) -> Schema {
        int_schema("output")
    }
    async fn execute(&self, input: Entity, _context: &ExecutionContext) -> Result<Entity> {
        let n = int_input(&input, "input");
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(n * 2));
        Ok(out)
    }
}

/// `{a: int, b: int} -> {output: a + b}`. Used by the compound-merge and
/// multi-producer dataflow fixtures.
pub struct TestAdd;

#[async_trait]
impl TaskBody for TestAdd {
    fn type_name(&self) -> &str {
        "TestAdd"
    }
    fn input_schema(&self) -> Schema {
        let mut properties = BTreeMap::new();
        properties.insert("a".to_string(), PropertySchema::new(PropertyType::Integer).nullable());
        properties.insert("b".to_string(), PropertySchema::new(PropertyType::Integer).nullable());
        Schema::new(properties, Default::default()).expect("TestAdd input schema is always valid")
    }
    fn output_schema(&self) -> Schema {
        int_schema("output")
    }
    async fn execute(&self, input: Entity, _context: &ExecutionContext) -> Result<Entity> {
        let a = int_input(&input, "a");
        let b = int_input(&input, "b");
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(a + b));
        Ok(out)
    }
}

/// Unconditionally fails with a `workflow` error; exercises Scenario E4
/// (first failure cancels running siblings, failed-over-aborted error
/// precedence).
pub struct FailingTask;

#[async_trait]
impl TaskBody for FailingTask {
    fn type_name(&self) -> &str {
        "FailingTask"
    }
    fn input_schema(&self) -> Schema {
        empty_schema()
    }
    fn output_schema(&self) -> Schema {
        empty_schema()
    }
    async fn execute(&self, _input: Entity, _context: &ExecutionContext) -> Result<Entity> {
        Err(Error::workflow("boom"))
    }
}

/// Blocks on `context.signal.cancelled()` instead of returning; pairs
/// with [`FailingTask`] to exercise cooperative cancellation under
/// `fail_fast`.
pub struct LongRunningTask;

#[async_trait]
impl TaskBody for LongRunningTask {
    fn type_name(&self) -> &str {
        "LongRunningTask"
    }
    fn input_schema(&self) -> Schema {
        empty_schema()
    }
    fn output_schema(&self) -> Schema {
        empty_schema()
    }
    async fn execute(&self, _input: Entity, context: &ExecutionContext) -> Result<Entity> {
        context.signal.cancelled().await;
        Err(Error::workflow("cancelled before completion"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_task_fixed_output() {
        let mut out = Entity::new();
        out.insert("output".to_string(), serde_json::json!(7));
        let task = MockTask::new("Fixed").with_output(out.clone());
        let ctx = test_context();
        let result = task.execute(Entity::new(), &ctx).await.unwrap();
        assert_eq!(result, out);
    }

    #[tokio::test]
    async fn mock_task_handler_and_call_history() {
        let task = MockTaskBuilder::new("Echo")
            .handler(|input| Ok(input.clone()))
            .build();
        let mut input = Entity::new();
        input.insert("x".to_string(), serde_json::json!(1));
        let ctx = test_context();
        task.execute(input.clone(), &ctx).await.unwrap();
        assert_eq!(task.call_count(), 1);
        assert_eq!(task.call_history(), vec![input]);
    }

    #[tokio::test]
    async fn mock_task_fail_next_then_succeeds() {
        let task = MockTask::new("Flaky").with_error_message("synthetic failure");
        task.fail_next();
        let ctx = test_context();
        assert!(task.execute(Entity::new(), &ctx).await.is_err());
        assert!(task.execute(Entity::new(), &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_square_squares_its_input() {
        let mut input = Entity::new();
        input.insert("input".to_string(), serde_json::json!(5));
        let ctx = test_context();
        let out = TestSquare.execute(input, &ctx).await.unwrap();
        assert_eq!(out.get("output").unwrap(), &serde_json::json!(25));
    }

    #[tokio::test]
    async fn test_add_sums_its_inputs() {
        let mut input = Entity::new();
        input.insert("a".to_string(), serde_json::json!(2));
        input.insert("b".to_string(), serde_json::json!(3));
        let ctx = test_context();
        let out = TestAdd.execute(input, &ctx).await.unwrap();
        assert_eq!(out.get("output").unwrap(), &serde_json::json!(5));
    }

    #[tokio::test]
    async fn failing_task_always_errors() {
        let ctx = test_context();
        assert!(FailingTask.execute(Entity::new(), &ctx).await.is_err());
    }

    fn test_context() -> ExecutionContext {
        ExecutionContext::for_test(taskgraph::cancellation::CancellationSignal::new(), taskgraph::provenance::Provenance::new())
    }
}
