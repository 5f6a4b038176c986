// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! `taskgraph`: a directed task-graph execution engine with pluggable
//! durable storage for intermediate results and durable job queues.
//!
//! The crate decomposes into the six components of the design:
//!
//! - [`schema`] — Schema & Validator (A): record shape, split, validation.
//! - [`repository`] — Tabular Repository (B): the storage contract and
//!   its backends (in-memory, filesystem here; embedded/remote SQL and
//!   browser-embedded live in the sibling `taskgraph-sqlite`,
//!   `taskgraph-postgres`, and `taskgraph-indexeddb` crates).
//! - [`dataflow`] and [`graph`] — Dataflow & Graph (C): the DAG model.
//! - [`task`] and [`task_runner`] — Task & TaskRunner (D): the lifecycle
//!   state machine and the driver that invokes a task body.
//! - [`runner`] — Graph Runner (E): the wave scheduler.
//! - [`cache`] — Output Cache (F): content-addressed memoization.
//!
//! Supporting modules: [`entity`] (records, primary keys, canonical JSON,
//! fingerprinting), [`index`] (secondary index normalization/selection),
//! [`provenance`], [`cancellation`], [`events`], [`error`], and
//! [`metrics`] (optional Prometheus instrumentation, `metrics` feature).

pub mod cache;
pub mod cancellation;
pub mod dataflow;
pub mod entity;
pub mod error;
pub mod events;
pub mod graph;
pub mod index;
pub mod metrics;
pub mod provenance;
pub mod repository;
pub mod runner;
pub mod schema;
pub mod task;
pub mod task_runner;

pub use cache::OutputCache;
pub use dataflow::Dataflow;
pub use entity::{Entity, PrimaryKey, Value};
pub use error::{Error, Result};
pub use graph::TaskGraph;
pub use provenance::Provenance;
pub use repository::Repository;
pub use runner::{GraphRunner, NamedGraphResult, RunnerOptions, TaskBodyRegistry};
pub use schema::Schema;
pub use task::{Task, TaskConfig, TaskStatus};
pub use task_runner::{ExecutionContext, TaskBody, TaskRunner};
