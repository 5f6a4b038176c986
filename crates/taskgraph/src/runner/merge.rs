// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Multi-producer merge strategies: how the graph runner combines values
//! written to the same target port by more than one source dataflow in
//! the same wave (spec §4.5).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Per-task configuration of how concurrent writes to one input port are
/// combined. Producer id order means "sorted by source task id", the
/// reading we adopted for spec §9 open question (i).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompoundMerge {
    /// Single producer: take its value as-is. Multiple producers: collect
    /// into an array ordered by producer (source task) id.
    #[default]
    LastOrPropertyArray,
    /// Always an array, even for a single producer.
    PropertyArray,
    /// An array, but producer order is unspecified (insertion order here,
    /// which is nondeterministic across async completion order).
    UnorderedArray,
    /// Only the value from the lexicographically last producer id.
    Last,
    /// An object keyed by producer (source task) id.
    Named,
}

/// One write to a target port, tagged with the id of the task that
/// produced it.
#[derive(Debug, Clone)]
pub struct PortWrite {
    /// Id of the task that produced `value`.
    pub producer_id: String,
    /// The value written.
    pub value: Json,
}

/// Merge every `write` targeting a single port per `strategy` (spec §4.5).
/// `writes` need not be pre-sorted; strategies that care about order sort
/// internally by `producer_id`.
pub fn merge_writes(strategy: CompoundMerge, mut writes: Vec<PortWrite>) -> Json {
    match strategy {
        CompoundMerge::LastOrPropertyArray => {
            if writes.len() == 1 {
                writes.pop().expect("length checked above").value
            } else {
                writes.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
                Json::Array(writes.into_iter().map(|w| w.value).collect())
            }
        }
        CompoundMerge::PropertyArray => {
            writes.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
            Json::Array(writes.into_iter().map(|w| w.value).collect())
        }
        CompoundMerge::UnorderedArray => Json::Array(writes.into_iter().map(|w| w.value).collect()),
        CompoundMerge::Last => {
            writes.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
            writes
                .pop()
                .map(|w| w.value)
                .unwrap_or(Json::Null)
        }
        CompoundMerge::Named => {
            let mut obj = serde_json::Map::new();
            for write in writes {
                obj.insert(write.producer_id, write.value);
            }
            Json::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(id: &str, value: i64) -> PortWrite {
        PortWrite {
            producer_id: id.to_string(),
            value: serde_json::json!(value),
        }
    }

    #[test]
    fn last_or_property_array_single_producer_is_bare() {
        let merged = merge_writes(CompoundMerge::LastOrPropertyArray, vec![write("A", 1)]);
        assert_eq!(merged, serde_json::json!(1));
    }

    #[test]
    fn last_or_property_array_multi_producer_is_sorted_array() {
        let merged = merge_writes(
            CompoundMerge::LastOrPropertyArray,
            vec![write("B", 2), write("A", 1)],
        );
        assert_eq!(merged, serde_json::json!([1, 2]));
    }

    #[test]
    fn property_array_always_arrays() {
        let merged = merge_writes(CompoundMerge::PropertyArray, vec![write("A", 1)]);
        assert_eq!(merged, serde_json::json!([1]));
    }

    #[test]
    fn last_keeps_lexicographically_last_producer() {
        let merged = merge_writes(CompoundMerge::Last, vec![write("A", 1), write("Z", 9)]);
        assert_eq!(merged, serde_json::json!(9));
    }

    #[test]
    fn named_keys_by_producer_id() {
        let merged = merge_writes(CompoundMerge::Named, vec![write("A", 1), write("B", 2)]);
        assert_eq!(merged, serde_json::json!({"A": 1, "B": 2}));
    }
}
