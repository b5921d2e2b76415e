//! Online ranking engine (C6, §4.6).
//!
//! Per request: load the precomputed candidate record, hydrate context in
//! parallel, fold the pre-filter chain, reattach scores, hydrate content
//! metadata for survivors, then fold the post-reorder chain. All in
//! declared order; no rule introduces ids it did not receive (enforced by
//! construction in every rule in `rules::pre_filter`/`rules::post_reorder`).

use crate::config::Config;
use crate::context::{fetch_content_meta, fetch_user_context, StockAffinitySource};
use crate::db::Database;
use crate::models::{sort_scored_desc, ItemId, UserContext};
use crate::rules::post_reorder::{AddScoreNoise, BoostTopReturnStock, BoostUserStocks, MarketCapRecencyRandom};
use crate::rules::pre_filter::ExcludeSeenItems;
use crate::rules::{PostReorderRule, PreFilterRule};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

/// Final ranked output of one request.
#[derive(Debug, Clone, Default)]
pub struct RankingResult {
    pub ranked: Vec<(ItemId, f64)>,
}

/// Builds the engine's fixed rule chains from config (§4.6's "Required
/// rules (core set)"), in the spec's declared order.
pub struct RankingEngine {
    pre_filter_rules: Vec<Box<dyn PreFilterRule>>,
    post_reorder_rules: Vec<Box<dyn PostReorderRule>>,
}

impl RankingEngine {
    pub fn new(config: &Config) -> Self {
        let pre_filter_rules: Vec<Box<dyn PreFilterRule>> = vec![Box::new(ExcludeSeenItems)];
        let post_reorder_rules: Vec<Box<dyn PostReorderRule>> = vec![
            Box::new(MarketCapRecencyRandom::new(config.market_cap_recency_weights.clone())),
            Box::new(BoostUserStocks::new(config.boost_weights.clone())),
            Box::new(BoostTopReturnStock::new(config.top_return_boost_factor)),
            Box::new(AddScoreNoise::new(config.noise_level)),
        ];
        Self {
            pre_filter_rules,
            post_reorder_rules,
        }
    }

    /// Runs the full pipeline for `cust_no` (§4.6 steps 1-7). Returns an
    /// empty result with no error when the candidate record is absent or
    /// empty, or when hydration/rule stages degrade to nothing — the
    /// caller decides status code semantics.
    pub async fn rank(
        &self,
        db: &Database,
        affinity: &dyn StockAffinitySource,
        config: &Config,
        cust_no: &str,
    ) -> RankingResult {
        let start = std::time::Instant::now();

        // Step 1 + 2: candidate record load and context hydration run
        // concurrently; neither depends on the other's output.
        let (candidate_record, mut user_ctx) = tokio::join!(
            db.get_candidate_record(cust_no),
            fetch_user_context(db, affinity, config, cust_no)
        );

        let record = match candidate_record {
            Ok(Some(r)) if !r.is_empty() => r,
            Ok(_) => {
                tracing::info!(cust_no, status = "ok_empty", duration_ms = start.elapsed().as_millis(), returned_count = 0, "no candidates");
                return RankingResult::default();
            }
            Err(e) => {
                tracing::warn!(cust_no, error = %e, "candidate record load failed; degrading to empty");
                return RankingResult::default();
            }
        };

        let original_scores: HashMap<ItemId, f64> = record.curation_list.iter().cloned().collect();
        let ids: Vec<ItemId> = record.curation_list.iter().map(|(id, _)| id.clone()).collect();

        // Step 3: pre-filter chain, sequential and declared-order.
        let mut filtered = ids;
        for rule in &self.pre_filter_rules {
            let before = filtered.len();
            let input = filtered.clone();
            let result = AssertUnwindSafe(rule.apply(&user_ctx, filtered)).catch_unwind().await;
            filtered = match result {
                Ok(out) => out,
                Err(payload) => {
                    let err = crate::error::EngineError::RuleFailure {
                        rule: rule.name().to_string(),
                        reason: crate::error::panic_reason(&*payload),
                    };
                    tracing::warn!(cust_no, error = %err, "pre-filter rule panicked; no items removed this pass");
                    input
                }
            };
            tracing::debug!(
                rule = rule.name(),
                cust_no,
                input_size = before,
                output_size = filtered.len(),
                "pre-filter applied"
            );
        }

        // Step 4: reattach original scores, preserving relative order for
        // equal scores since `filtered` retains the record's ordering.
        let mut ranked: Vec<(ItemId, f64)> = filtered
            .into_iter()
            .map(|id| {
                let score = *original_scores.get(&id).unwrap_or(&0.0);
                (id, score)
            })
            .collect();
        sort_scored_desc(&mut ranked);

        // Step 5: hydrate content metadata for survivors only.
        let surviving_ids: Vec<ItemId> = ranked.iter().map(|(id, _)| id.clone()).collect();
        user_ctx.content_meta = fetch_content_meta(db, &surviving_ids).await;

        // Step 6: post-reorder chain, re-sorting after each rule.
        for rule in &self.post_reorder_rules {
            let before_len = ranked.len();
            let input = ranked.clone();
            let result = AssertUnwindSafe(rule.apply(&user_ctx, ranked)).catch_unwind().await;
            ranked = match result {
                Ok(out) => out,
                Err(payload) => {
                    let err = crate::error::EngineError::RuleFailure {
                        rule: rule.name().to_string(),
                        reason: crate::error::panic_reason(&*payload),
                    };
                    tracing::warn!(cust_no, error = %err, "post-reorder rule panicked; scores unchanged this pass");
                    input
                }
            };
            if ranked.len() != before_len {
                tracing::error!(rule = rule.name(), cust_no, before_len, after_len = ranked.len(), "post-reorder rule changed item count");
            }
            sort_scored_desc(&mut ranked);
        }

        // Step 7: truncate to RECOMMENDATION_COUNT.
        ranked.truncate(config.recommendation_count);

        tracing::info!(
            cust_no,
            status = "ok",
            duration_ms = start.elapsed().as_millis(),
            returned_count = ranked.len(),
            "ranking request complete"
        );

        RankingResult { ranked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticStockAffinitySource;
    use crate::db::Database;
    use crate::models::{CandidateRecord, ContentMeta};
    use std::collections::HashSet;

    async fn db_with_record(record: CandidateRecord, contents: Vec<ContentMeta>) -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        db.save_candidates(&[record], 100).await;
        for c in contents {
            db.upsert_content(&c).await.unwrap();
        }
        (db, dir)
    }

    #[tokio::test]
    async fn scenario_b_pre_filter_excludes_seen() {
        let record = CandidateRecord::from_scored(
            "u1",
            vec![("a".to_string(), 3.0), ("b".to_string(), 2.0), ("c".to_string(), 1.0)],
            500,
            chrono::Utc::now(),
        );
        let (db, _dir) = db_with_record(record, vec![]).await;
        db.insert_curation_log("u1", "b", chrono::Utc::now()).await.unwrap();

        let mut config = Config::default();
        config.noise_level = 0.0; // isolate ordering from AddScoreNoise jitter
        let engine = RankingEngine::new(&config);
        let affinity = StaticStockAffinitySource::default();

        let result = engine.rank(&db, &affinity, &config, "u1").await;
        let ids: Vec<&str> = result.ranked.iter().map(|(id, _)| id.as_str()).collect();
        assert!(!ids.contains(&"b"));
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"c"));
    }

    #[tokio::test]
    async fn empty_candidate_record_returns_empty_ok() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let config = Config::default();
        let engine = RankingEngine::new(&config);
        let affinity = StaticStockAffinitySource::default();

        let result = engine.rank(&db, &affinity, &config, "ghost").await;
        assert!(result.ranked.is_empty());
    }

    #[tokio::test]
    async fn degraded_portfolio_scenario_f_falls_back_to_base_ranking() {
        let record = CandidateRecord::from_scored(
            "u1",
            vec![("p".to_string(), 1.0), ("q".to_string(), 1.0)],
            500,
            chrono::Utc::now(),
        );
        let contents = vec![
            ContentMeta::new("p").with_label("SAMS"),
            ContentMeta::new("q").with_label("KAK"),
        ];
        let (db, _dir) = db_with_record(record, contents).await;
        let mut config = Config::default();
        config.noise_level = 0.0;
        let engine = RankingEngine::new(&config);

        // No owned stocks resolved at all (degraded portfolio) => boosts are no-ops.
        let affinity = StaticStockAffinitySource::default();
        let result = engine.rank(&db, &affinity, &config, "u1").await;
        assert_eq!(result.ranked.len(), 2);
        for (_, score) in &result.ranked {
            assert!((*score - 1.0).abs() < 1e-9 || *score >= 1.0);
        }
    }

    #[tokio::test]
    async fn scenario_c_boost_user_stocks_ordering() {
        let record = CandidateRecord::from_scored(
            "u1",
            vec![("x".to_string(), 1.0), ("y".to_string(), 1.0)],
            500,
            chrono::Utc::now(),
        );
        let contents = vec![
            ContentMeta::new("x").with_label("SAMS"),
            ContentMeta::new("y").with_label("KAK"),
        ];
        let (db, _dir) = db_with_record(record, contents).await;
        let mut config = Config::default();
        config.noise_level = 0.0;
        config.market_cap_recency_weights = crate::config::MarketCapRecencyWeights {
            score: 1.0,
            market_cap: 0.0,
            recency: 0.0,
            noise: 0.0,
        };
        let engine = RankingEngine::new(&config);

        let mut affinity = StaticStockAffinitySource::default();
        affinity.owned.insert("u1".to_string(), HashSet::from(["SAMS".to_string()]));
        affinity.recent.insert("u1".to_string(), HashSet::from(["KAK".to_string()]));

        let result = engine.rank(&db, &affinity, &config, "u1").await;
        assert_eq!(result.ranked[0].0, "x");
        assert_eq!(result.ranked[1].0, "y");
    }
}
