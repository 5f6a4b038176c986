// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Provenance: an unordered record of caller-supplied context that
//! contributes to the output-cache fingerprint without being part of a
//! task's declared input (spec §3.1, §4.6).

use serde_json::Value as Json;
use std::collections::BTreeMap;

/// A provenance record. `BTreeMap` so two provenances with the same
/// entries always canonicalize identically regardless of insertion order.
pub type Provenance = BTreeMap<String, Json>;

/// Merge a task's own `config.provenance` over the run's parent
/// provenance; the task's entries win on key collision (spec §4.4 step 2:
/// "combined with each task's own provenance").
pub fn merge(parent: &Provenance, own: &Provenance) -> Provenance {
    let mut merged = parent.clone();
    for (k, v) in own {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_provenance_wins_on_collision() {
        let mut parent = Provenance::new();
        parent.insert("run_id".to_string(), serde_json::json!("r1"));
        parent.insert("env".to_string(), serde_json::json!("prod"));
        let mut own = Provenance::new();
        own.insert("env".to_string(), serde_json::json!("staging"));
        let merged = merge(&parent, &own);
        assert_eq!(merged.get("env").unwrap(), "staging");
        assert_eq!(merged.get("run_id").unwrap(), "r1");
    }
}
