// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Secondary index declaration, normalization, and selection (spec §4.2).
//!
//! An index is a non-empty ordered sequence of property names, declared at
//! repository construction time. Declaration order is significant: it
//! reflects leftmost-prefix search semantics, the same convention the
//! teacher's SQL-backed checkpointers use for their `thread_id`/timestamp
//! composite lookups.

use std::collections::BTreeSet;

/// A declared secondary index: an ordered, non-empty list of column names.
pub type Index = Vec<String>;

fn is_prefix_of(candidate: &[String], of: &[String]) -> bool {
    candidate.len() < of.len() && of.starts_with(candidate)
}

/// Normalize a set of declared indexes against the primary key: drop any
/// index that is a strict prefix of another declared index or of the
/// primary key, except single-column indexes, which are always retained
/// (spec §3.1).
pub fn normalize_indexes(primary_key: &[String], declared: &[Index]) -> Vec<Index> {
    let mut kept = Vec::new();
    for (i, candidate) in declared.iter().enumerate() {
        if candidate.len() == 1 {
            kept.push(candidate.clone());
            continue;
        }
        let is_prefix_of_pk = is_prefix_of(candidate, primary_key);
        let is_prefix_of_another = declared
            .iter()
            .enumerate()
            .any(|(j, other)| i != j && is_prefix_of(candidate, other));
        if !is_prefix_of_pk && !is_prefix_of_another {
            kept.push(candidate.clone());
        }
    }
    kept
}

/// `findBestMatchingIndex`: given the unordered set of requested search
/// keys, return the index (candidates are the primary key plus every
/// declared index) whose leftmost contiguous prefix has the greatest
/// overlap with the requested keys. Ties are broken by declaration order.
/// If no candidate's first column is in the requested set, returns `None`.
pub fn find_best_matching_index<'a>(
    primary_key: &'a [String],
    declared_indexes: &'a [Index],
    requested: &BTreeSet<String>,
) -> Option<&'a [String]> {
    let candidates: Vec<&[String]> = std::iter::once(primary_key)
        .chain(declared_indexes.iter().map(Vec::as_slice))
        .collect();

    let mut best: Option<(&[String], usize)> = None;
    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        let mut overlap = 0;
        for col in candidate {
            if requested.contains(col) {
                overlap += 1;
            } else {
                break;
            }
        }
        if overlap == 0 {
            continue;
        }
        match best {
            Some((_, best_overlap)) if best_overlap >= overlap => {}
            _ => best = Some((candidate, overlap)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(cols: &[&str]) -> Index {
        cols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_drops_prefix_of_another_index() {
        let pk = idx(&["id"]);
        let declared = vec![idx(&["category"]), idx(&["category", "subcategory"]), idx(&["value"])];
        let normalized = normalize_indexes(&pk, &declared);
        // "category" alone is a single-column index: always retained even
        // though it is a strict prefix of [category, subcategory].
        assert_eq!(normalized.len(), 3);
    }

    #[test]
    fn normalize_drops_multi_column_prefix_of_primary_key() {
        let pk = idx(&["tenant", "id"]);
        let declared = vec![idx(&["tenant"]), idx(&["tenant", "extra"])];
        let normalized = normalize_indexes(&pk, &declared);
        assert!(normalized.contains(&idx(&["tenant"])));
        assert!(!normalized.contains(&idx(&["tenant", "extra"])));
    }

    fn set(cols: &[&str]) -> BTreeSet<String> {
        cols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn find_best_matching_index_is_order_independent() {
        let pk = idx(&["id"]);
        let declared = vec![
            idx(&["category"]),
            idx(&["category", "subcategory"]),
            idx(&["value"]),
        ];
        let a = find_best_matching_index(&pk, &declared, &set(&["category", "subcategory"]));
        let b = find_best_matching_index(&pk, &declared, &set(&["subcategory", "category"]));
        assert_eq!(a, Some(idx(&["category", "subcategory"]).as_slice()));
        assert_eq!(a, b);
    }

    #[test]
    fn find_best_matching_index_prefers_greater_prefix_overlap() {
        let pk = idx(&["id"]);
        let declared = vec![idx(&["category"]), idx(&["category", "subcategory"])];
        let best = find_best_matching_index(&pk, &declared, &set(&["category", "subcategory"]));
        assert_eq!(best, Some(idx(&["category", "subcategory"]).as_slice()));
    }

    #[test]
    fn find_best_matching_index_none_when_first_column_unmatched() {
        let pk = idx(&["id"]);
        let declared = vec![idx(&["category", "subcategory"])];
        let best = find_best_matching_index(&pk, &declared, &set(&["subcategory"]));
        assert_eq!(best, None);
    }
}
