//! Post-reorder rules (online, §4.6). Declared order:
//! `MarketCapRecencyRandom`, `BoostUserStocks`, `BoostTopReturnStock`,
//! `AddScoreNoise` (always last).

use super::PostReorderRule;
use crate::config::MarketCapRecencyWeights;
use crate::models::{sort_scored_desc, ItemId, UserContext};
use async_trait::async_trait;
use rand::Rng;
use statrs::distribution::{ContinuousCDF, Normal};

/// z-score standardizes `values` (sample std, falling back to all-0.5 when
/// variance is zero) then maps each through the standard-normal CDF.
fn standardize_and_cdf(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)
    } else {
        0.0
    };
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return vec![0.5; n];
    }

    let normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");
    values
        .iter()
        .map(|v| normal.cdf((v - mean) / std_dev))
        .collect()
}

/// Combines the original score with normalized market-cap rank, normalized
/// recency, and independent uniform noise, each z-score standardized and
/// mapped through the standard-normal CDF, then weighted-summed.
pub struct MarketCapRecencyRandom {
    pub weights: MarketCapRecencyWeights,
}

impl MarketCapRecencyRandom {
    pub fn new(weights: MarketCapRecencyWeights) -> Self {
        Self { weights }
    }
}

const OLDEST_SENTINEL: i64 = 0; // unix epoch stands in for "missing creation time"

#[async_trait]
impl PostReorderRule for MarketCapRecencyRandom {
    fn name(&self) -> &'static str {
        "MarketCapRecencyRandom"
    }

    async fn apply(&self, ctx: &UserContext, ranked: Vec<(ItemId, f64)>) -> Vec<(ItemId, f64)> {
        if ranked.is_empty() {
            return ranked;
        }

        let orig_scores: Vec<f64> = ranked.iter().map(|(_, s)| *s).collect();
        let market_caps: Vec<f64> = ranked
            .iter()
            .map(|(id, _)| {
                ctx.content_meta
                    .get(id)
                    .and_then(|m| m.market_cap)
                    .unwrap_or(0.0)
            })
            .collect();
        let recency_ts: Vec<i64> = ranked
            .iter()
            .map(|(id, _)| {
                ctx.content_meta
                    .get(id)
                    .map(|m| m.created_at.timestamp())
                    .unwrap_or(OLDEST_SENTINEL)
            })
            .collect();

        // Rank market caps ascending (lowest = rank 1) so standardization
        // operates on rank position, not raw magnitude.
        let market_cap_ranks = rank_ascending(&market_caps);
        let recency_values: Vec<f64> = recency_ts.iter().map(|t| *t as f64).collect();

        let mut rng = rand::thread_rng();
        let noise: Vec<f64> = (0..ranked.len()).map(|_| rng.gen_range(0.0..1.0)).collect();

        let score_component = standardize_and_cdf(&orig_scores);
        let market_cap_component = standardize_and_cdf(&market_cap_ranks);
        let recency_component = standardize_and_cdf(&recency_values);
        let noise_component = standardize_and_cdf(&noise);

        let w = &self.weights;
        let mut combined: Vec<(ItemId, f64)> = ranked
            .into_iter()
            .enumerate()
            .map(|(i, (id, _))| {
                let score = w.score * score_component[i]
                    + w.market_cap * market_cap_component[i]
                    + w.recency * recency_component[i]
                    + w.noise * noise_component[i];
                (id, score)
            })
            .collect();

        sort_scored_desc(&mut combined);
        combined
    }
}

/// Assigns ascending rank positions (1-indexed) to `values`; equal values
/// receive whatever order a stable sort produces (no declared tie rule in
/// the source for this particular rank).
fn rank_ascending(values: &[f64]) -> Vec<f64> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut ranks = vec![0.0; values.len()];
    for (rank, idx) in indices.into_iter().enumerate() {
        ranks[idx] = (rank + 1) as f64;
    }
    ranks
}

/// Multiplies each item's score by the maximum applicable boost factor
/// among owned/recent/group1/onboarding stock-affinity sets.
pub struct BoostUserStocks {
    pub weights: crate::config::BoostWeights,
}

impl BoostUserStocks {
    pub fn new(weights: crate::config::BoostWeights) -> Self {
        Self { weights }
    }
}

#[async_trait]
impl PostReorderRule for BoostUserStocks {
    fn name(&self) -> &'static str {
        "BoostUserStocks"
    }

    async fn apply(&self, ctx: &UserContext, ranked: Vec<(ItemId, f64)>) -> Vec<(ItemId, f64)> {
        if ctx.has_no_stock_affinity() {
            return ranked;
        }

        let mut boosted: Vec<(ItemId, f64)> = ranked
            .into_iter()
            .map(|(id, score)| {
                let stock_code = match ctx.content_meta.get(&id) {
                    Some(meta) if !meta.label.is_empty() => meta.label.clone(),
                    _ => return (id, score),
                };

                let mut boost = 1.0_f64;
                if ctx.owned_stocks.contains(&stock_code) {
                    boost = boost.max(self.weights.owned);
                }
                if ctx.recent_stocks.contains(&stock_code) {
                    boost = boost.max(self.weights.recent);
                }
                if ctx.group1_stocks.contains(&stock_code) {
                    boost = boost.max(self.weights.group1);
                }
                if ctx.onboarding_stocks.contains(&stock_code) {
                    boost = boost.max(self.weights.onboarding);
                }

                (id, score * boost)
            })
            .collect();

        sort_scored_desc(&mut boosted);
        boosted
    }
}

/// Finds the owned stock with the highest 1-month return (falling back to
/// 1-day), then multiplies scores for items labeled with that stock.
pub struct BoostTopReturnStock {
    pub boost_factor: f64,
}

impl BoostTopReturnStock {
    pub fn new(boost_factor: f64) -> Self {
        Self { boost_factor }
    }

    fn find_top_return_stock(ctx: &UserContext) -> Option<String> {
        let mut top_stock: Option<String> = None;
        let mut max_return = f64::NEG_INFINITY;

        for stock_code in &ctx.owned_stocks {
            let Some(returns) = ctx.owned_stock_returns.get(stock_code) else {
                continue;
            };
            let current_return = returns.one_month.or(returns.one_day);
            if let Some(r) = current_return {
                if r > max_return {
                    max_return = r;
                    top_stock = Some(stock_code.clone());
                }
            }
        }

        top_stock
    }
}

#[async_trait]
impl PostReorderRule for BoostTopReturnStock {
    fn name(&self) -> &'static str {
        "BoostTopReturnStock"
    }

    async fn apply(&self, ctx: &UserContext, ranked: Vec<(ItemId, f64)>) -> Vec<(ItemId, f64)> {
        if ctx.owned_stocks.is_empty() || ctx.owned_stock_returns.is_empty() {
            return ranked;
        }

        let Some(top_stock) = Self::find_top_return_stock(ctx) else {
            return ranked;
        };

        let mut boosted: Vec<(ItemId, f64)> = ranked
            .into_iter()
            .map(|(id, score)| {
                let matches = ctx
                    .content_meta
                    .get(&id)
                    .map(|meta| meta.label == top_stock)
                    .unwrap_or(false);
                if matches {
                    (id, score * self.boost_factor)
                } else {
                    (id, score)
                }
            })
            .collect();

        sort_scored_desc(&mut boosted);
        boosted
    }
}

/// Adds `uniform(0, noise_level)` to every score for stable diversity.
/// Always the last post-reorder rule in the declared order. Preserves the
/// multiset of item ids (I3): no item is added, removed, or duplicated.
pub struct AddScoreNoise {
    pub noise_level: f64,
}

impl AddScoreNoise {
    pub fn new(noise_level: f64) -> Self {
        Self { noise_level }
    }
}

#[async_trait]
impl PostReorderRule for AddScoreNoise {
    fn name(&self) -> &'static str {
        "AddScoreNoise"
    }

    async fn apply(&self, _ctx: &UserContext, ranked: Vec<(ItemId, f64)>) -> Vec<(ItemId, f64)> {
        let mut rng = rand::thread_rng();
        let mut noised: Vec<(ItemId, f64)> = ranked
            .into_iter()
            .map(|(id, score)| {
                let noise = rng.gen_range(0.0..self.noise_level);
                (id, score + noise)
            })
            .collect();
        sort_scored_desc(&mut noised);
        noised
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentMeta;
    use std::collections::HashSet;

    fn meta_with_label(id: &str, label: &str) -> ContentMeta {
        ContentMeta::new(id).with_label(label)
    }

    #[tokio::test]
    async fn boost_user_stocks_scenario_c() {
        let mut ctx = UserContext::new("u1");
        ctx.content_meta
            .insert("x".to_string(), meta_with_label("x", "SAMS"));
        ctx.content_meta
            .insert("y".to_string(), meta_with_label("y", "KAK"));
        ctx.owned_stocks = HashSet::from(["SAMS".to_string()]);
        ctx.recent_stocks = HashSet::from(["KAK".to_string()]);

        let rule = BoostUserStocks::new(crate::config::BoostWeights::default());
        let out = rule
            .apply(&ctx, vec![("x".to_string(), 1.0), ("y".to_string(), 1.0)])
            .await;

        assert_eq!(out, vec![("x".to_string(), 1.5), ("y".to_string(), 1.3)]);
    }

    #[tokio::test]
    async fn boost_top_return_stock_scenario_d() {
        use crate::models::StockReturn;

        let mut ctx = UserContext::new("u1");
        ctx.content_meta
            .insert("p".to_string(), meta_with_label("p", "SAMS"));
        ctx.content_meta
            .insert("q".to_string(), meta_with_label("q", "KAK"));
        ctx.owned_stocks = HashSet::from(["SAMS".to_string(), "KAK".to_string()]);
        ctx.owned_stock_returns.insert(
            "SAMS".to_string(),
            StockReturn {
                one_day: None,
                one_month: Some(0.05),
            },
        );
        ctx.owned_stock_returns.insert(
            "KAK".to_string(),
            StockReturn {
                one_day: None,
                one_month: Some(0.10),
            },
        );

        let rule = BoostTopReturnStock::new(2.0);
        let out = rule
            .apply(&ctx, vec![("p".to_string(), 1.0), ("q".to_string(), 1.0)])
            .await;

        let q_score = out.iter().find(|(id, _)| id == "q").unwrap().1;
        let p_score = out.iter().find(|(id, _)| id == "p").unwrap().1;
        assert_eq!(q_score, 2.0);
        assert_eq!(p_score, 1.0);
    }

    #[tokio::test]
    async fn boost_top_return_stock_noop_when_owned_empty() {
        let ctx = UserContext::new("u1");
        let rule = BoostTopReturnStock::new(2.0);
        let input = vec![("p".to_string(), 1.0)];
        let out = rule.apply(&ctx, input.clone()).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn add_score_noise_preserves_id_multiset() {
        let ctx = UserContext::new("u1");
        let rule = AddScoreNoise::new(0.01);
        let input = vec![
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
            ("c".to_string(), 0.5),
        ];
        let mut input_ids: Vec<String> = input.iter().map(|(id, _)| id.clone()).collect();
        input_ids.sort();

        let out = rule.apply(&ctx, input).await;
        let mut out_ids: Vec<String> = out.iter().map(|(id, _)| id.clone()).collect();
        out_ids.sort();

        assert_eq!(input_ids, out_ids);
        for (_, score) in &out {
            assert!(*score >= 0.0 && *score <= 2.01);
        }
    }

    #[tokio::test]
    async fn market_cap_recency_random_is_noop_shape_preserving() {
        let mut ctx = UserContext::new("u1");
        ctx.content_meta.insert(
            "a".to_string(),
            ContentMeta::new("a").with_label("SAMS"),
        );
        ctx.content_meta.insert(
            "b".to_string(),
            ContentMeta::new("b").with_label("KAK"),
        );
        let rule = MarketCapRecencyRandom::new(crate::config::MarketCapRecencyWeights::default());
        let input = vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)];
        let out = rule.apply(&ctx, input).await;
        assert_eq!(out.len(), 2);
        let ids: HashSet<String> = out.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, HashSet::from(["a".to_string(), "b".to_string()]));
    }
}
