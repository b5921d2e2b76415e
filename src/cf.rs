//! Collaborative-filtering similarity model (C3, §4.3).
//!
//! A single-threaded, once-per-batch builder: `build` consumes a
//! `{user -> items}` interaction table and produces a symmetric
//! item-item Jaccard similarity map, kept in memory as a read-only
//! artifact for the life of one batch run (§5's "Shared resources").

use crate::models::ItemId;
use std::collections::{HashMap, HashSet};

/// Item-item Jaccard similarity, keyed by an order-independent pair.
/// `build` runs once per batch; `is_ready` gates every scorer until it
/// has completed (§4.3).
#[derive(Debug, Default)]
pub struct CfModel {
    similarity: HashMap<(ItemId, ItemId), f64>,
    ready: bool,
}

fn pair_key(a: &str, b: &str) -> (ItemId, ItemId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl CfModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Builds the similarity map from `{user -> item history}`. A pair
    /// `(i, j)` is emitted only when `|users(i) ∩ users(j)| >= min_co_occurrence`;
    /// `sim(i, j) = |intersection| / |union|`. Self-pairs are omitted.
    pub fn build(&mut self, interactions: &HashMap<String, Vec<ItemId>>, min_co_occurrence: usize) {
        let mut users_by_item: HashMap<&ItemId, HashSet<&str>> = HashMap::new();
        for (user, items) in interactions {
            for item in items {
                users_by_item.entry(item).or_default().insert(user.as_str());
            }
        }

        let items: Vec<&ItemId> = users_by_item.keys().copied().collect();
        let mut similarity = HashMap::new();

        for i in 0..items.len() {
            for j in (i + 1)..items.len() {
                let (item_i, item_j) = (items[i], items[j]);
                let users_i = &users_by_item[item_i];
                let users_j = &users_by_item[item_j];
                let intersection = users_i.intersection(users_j).count();
                if intersection < min_co_occurrence {
                    continue;
                }
                let union = users_i.union(users_j).count();
                if union == 0 {
                    continue;
                }
                let sim = intersection as f64 / union as f64;
                similarity.insert(pair_key(item_i, item_j), sim);
            }
        }

        self.similarity = similarity;
        self.ready = true;
    }

    /// Symmetric lookup; returns `None` when the pair was never emitted.
    pub fn similarity(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return None;
        }
        self.similarity.get(&pair_key(a, b)).copied()
    }

    /// Scoring contract (§4.3): for history `h` (already truncated by the
    /// caller to `CF_USER_HISTORY_LIMIT`) and candidate set `c`, score for
    /// `c` is `sum over i in h of sim(i, c)`, missing entries treated as
    /// zero. Not ready => empty map.
    pub fn get_scores(&self, history: &[ItemId], candidates: &HashSet<ItemId>) -> HashMap<ItemId, f64> {
        let mut scores = HashMap::new();
        if !self.ready || history.is_empty() || candidates.is_empty() {
            return scores;
        }

        for candidate in candidates {
            let mut total = 0.0;
            for h in history {
                if let Some(sim) = self.similarity(h, candidate) {
                    total += sim;
                }
            }
            if total > 0.0 {
                scores.insert(candidate.clone(), total);
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interactions_fixture() -> HashMap<String, Vec<ItemId>> {
        HashMap::from([
            ("u1".to_string(), vec!["i1".to_string()]),
            ("u2".to_string(), vec!["i1".to_string(), "i2".to_string()]),
            ("u3".to_string(), vec!["i1".to_string(), "i2".to_string()]),
        ])
    }

    #[test]
    fn not_ready_before_build() {
        let model = CfModel::new();
        assert!(!model.is_ready());
    }

    #[test]
    fn scenario_a_cf_composition() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 1);
        assert!(model.is_ready());
        let sim = model.similarity("i1", "i2").unwrap();
        assert!((sim - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_is_symmetric() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 1);
        assert_eq!(model.similarity("i1", "i2"), model.similarity("i2", "i1"));
    }

    #[test]
    fn pairs_below_min_co_occurrence_are_omitted() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 3);
        assert!(model.similarity("i1", "i2").is_none());
    }

    #[test]
    fn get_scores_matches_spec_example() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 1);
        let candidates: HashSet<ItemId> = HashSet::from(["i2".to_string(), "i3".to_string()]);
        let scores = model.get_scores(&["i1".to_string()], &candidates);
        assert!((scores["i2"] - 2.0 / 3.0).abs() < 1e-9);
        assert!(!scores.contains_key("i3"));
    }

    #[test]
    fn empty_history_yields_no_scores() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 1);
        let candidates: HashSet<ItemId> = HashSet::from(["i2".to_string()]);
        let scores = model.get_scores(&[], &candidates);
        assert!(scores.is_empty());
    }

    #[test]
    fn not_ready_returns_empty_scores() {
        let model = CfModel::new();
        let candidates: HashSet<ItemId> = HashSet::from(["i2".to_string()]);
        let scores = model.get_scores(&["i1".to_string()], &candidates);
        assert!(scores.is_empty());
    }

    #[test]
    fn self_pairs_are_omitted() {
        let mut model = CfModel::new();
        model.build(&interactions_fixture(), 1);
        assert!(model.similarity("i1", "i1").is_none());
    }
}
