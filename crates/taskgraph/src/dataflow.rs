// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dataflow: a directed edge from one task's output port to another
//! task's input port (spec §3.1, §4.3).

use serde::{Deserialize, Serialize};

/// The sentinel port name denoting "the whole input/output record"
/// rather than a single named field (spec §3.1).
pub const WILDCARD_PORT: &str = "*";

/// A directed edge `(sourceTaskId, sourcePortId) -> (targetTaskId,
/// targetPortId)`. The target task id is `Option` so a dataflow can be
/// built before its target is wired in (spec §3.1: "target task id may
/// be deferred").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataflow {
    /// Id of the task producing the value.
    pub source_task_id: String,
    /// Output port on the source task, or [`WILDCARD_PORT`].
    pub source_port_id: String,
    /// Id of the task consuming the value, once bound.
    pub target_task_id: Option<String>,
    /// Input port on the target task, or [`WILDCARD_PORT`].
    pub target_port_id: String,
}

impl Dataflow {
    /// Construct a fully-bound dataflow.
    pub fn new(
        source_task_id: impl Into<String>,
        source_port_id: impl Into<String>,
        target_task_id: impl Into<String>,
        target_port_id: impl Into<String>,
    ) -> Self {
        Self {
            source_task_id: source_task_id.into(),
            source_port_id: source_port_id.into(),
            target_task_id: Some(target_task_id.into()),
            target_port_id: target_port_id.into(),
        }
    }

    /// Construct a dataflow whose target is not yet known, for builder-time
    /// construction ahead of the target task's registration.
    pub fn with_unbound_target(
        source_task_id: impl Into<String>,
        source_port_id: impl Into<String>,
        target_port_id: impl Into<String>,
    ) -> Self {
        Self {
            source_task_id: source_task_id.into(),
            source_port_id: source_port_id.into(),
            target_task_id: None,
            target_port_id: target_port_id.into(),
        }
    }

    /// Bind a previously-unbound target task id.
    pub fn bind_target(&mut self, target_task_id: impl Into<String>) {
        self.target_task_id = Some(target_task_id.into());
    }

    /// True if either endpoint uses the all-ports sentinel.
    pub fn is_wildcard(&self) -> bool {
        self.source_port_id == WILDCARD_PORT || self.target_port_id == WILDCARD_PORT
    }

    /// The canonical map key used inside [`crate::graph::TaskGraph`]:
    /// `"srcId[srcPort] ==> tgtId[tgtPort]"`. Panics if the target is
    /// unbound; only bound dataflows are ever inserted into a graph.
    pub fn key(&self) -> String {
        let target = self
            .target_task_id
            .as_deref()
            .expect("dataflow key() requires a bound target");
        format!(
            "{}[{}] ==> {}[{}]",
            self.source_task_id, self.source_port_id, target, self.target_port_id
        )
    }

    /// Reset hook: clears any cached in-flight value. Dataflows carry no
    /// buffered state of their own in this implementation (values are
    /// staged per-run by the graph runner), so this is a no-op retained
    /// for parity with the contract in spec §4.3; kept as a distinct
    /// method so a future buffered dataflow variant has a seam to hook.
    pub fn reset(&mut self) {}
}

/// Wire-format projection of a [`Dataflow`] (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataflowJson {
    /// Source task id.
    pub source_task_id: String,
    /// Source port id.
    pub source_task_port_id: String,
    /// Target task id.
    pub target_task_id: String,
    /// Target port id.
    pub target_task_port_id: String,
}

impl From<&Dataflow> for DataflowJson {
    fn from(df: &Dataflow) -> Self {
        DataflowJson {
            source_task_id: df.source_task_id.clone(),
            source_task_port_id: df.source_port_id.clone(),
            target_task_id: df
                .target_task_id
                .clone()
                .expect("serialized dataflows are always bound"),
            target_task_port_id: df.target_port_id.clone(),
        }
    }
}

impl From<DataflowJson> for Dataflow {
    fn from(json: DataflowJson) -> Self {
        Dataflow::new(
            json.source_task_id,
            json.source_task_port_id,
            json.target_task_id,
            json.target_task_port_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_canonical() {
        let df = Dataflow::new("A", "output", "B", "input");
        assert_eq!(df.key(), "A[output] ==> B[input]");
    }

    #[test]
    fn wildcard_detection() {
        let df = Dataflow::new("A", WILDCARD_PORT, "B", "input");
        assert!(df.is_wildcard());
        let df2 = Dataflow::new("A", "output", "B", "input");
        assert!(!df2.is_wildcard());
    }

    #[test]
    fn unbound_target_can_be_bound_later() {
        let mut df = Dataflow::with_unbound_target("A", "output", "input");
        assert!(df.target_task_id.is_none());
        df.bind_target("B");
        assert_eq!(df.key(), "A[output] ==> B[input]");
    }
}
