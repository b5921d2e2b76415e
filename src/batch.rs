//! Batch candidate generator (C4, §4.4).
//!
//! Orchestrates rule execution per user, combines global/local/other pools
//! with the CF signal, and persists `CandidateRecord`s. Per-user work runs
//! on a bounded async worker pool sized to `effective_batch_workers`
//! (§5's "bounded worker pool for batch with message passing for
//! progress" — here, progress is reported via `tracing` spans rather than
//! a separate channel, since the source's delayed-graph model has no
//! production consumer for per-user progress events).

use crate::cf::CfModel;
use crate::config::Config;
use crate::db::{Database, PortfolioClient};
use crate::models::{CandidateRecord, ContentMeta, ItemId, Pool, UserContext, UserProfile};
use crate::rules::global::{GlobalStockTopReturn, GlobalTopLikeContent, QuoteReturn};
use crate::rules::local::{
    LocalMarketContent, LocalOnboardingInterest, LocalOwnedStockLabel, LocalRelatedContent, LocalSectorContent,
    RelatedStockSource, UnknownRelatedStockSource,
};
use crate::rules::{union_preserving_order, BatchContext, GlobalRule, LocalRule};
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct BatchRunSummary {
    pub users_processed: usize,
    pub users_skipped: usize,
    pub records_saved: usize,
}

/// Runs one full batch cycle against `db`, per §4.4's numbered sequence.
/// Never panics on a single user's failure; logs and continues (§4.4's
/// "Failure policy").
pub async fn run_batch(db: &Database, config: &Config) -> anyhow::Result<BatchRunSummary> {
    run_batch_inner(db, config, false).await
}

/// Same as [`run_batch`] but skips the final persistence step when
/// `dry_run` is set, so operators can validate a config change against
/// real data without mutating the candidate store.
pub async fn run_batch_dry(db: &Database, config: &Config, dry_run: bool) -> anyhow::Result<BatchRunSummary> {
    run_batch_inner(db, config, dry_run).await
}

async fn run_batch_inner(db: &Database, config: &Config, dry_run: bool) -> anyhow::Result<BatchRunSummary> {
    // Step 2: load users and contents concurrently.
    let (users_result, contents_result) = tokio::join!(db.load_users(), db.load_contents());
    let users = users_result?;
    let contents = contents_result?;

    let content_by_id: HashMap<ItemId, ContentMeta> =
        contents.into_iter().map(|c| (c.item_id.clone(), c)).collect();

    // Step 3: interactions + CF model (single-threaded build, §4.3).
    let interactions = db.load_interactions(config.cf_interactions_window_days).await?;
    let mut cf_model = CfModel::new();
    cf_model.build(&interactions, config.cf_min_co_occurrence);

    let quotes = db
        .fetch_latest_quotes(1, 500, &config.allowed_countries)
        .await
        .unwrap_or_default();
    let quote_returns: Vec<QuoteReturn> = quotes
        .iter()
        .map(|q| QuoteReturn {
            code: q.code.clone(),
            country: q.country.clone(),
            one_day_return: q.one_day_return,
        })
        .collect();

    let allowed_countries = config.allowed_countries.clone();
    let stock_country: HashMap<String, String> = quotes
        .iter()
        .map(|q| (q.code.clone(), q.country.clone()))
        .collect();
    let batch_ctx = BatchContext {
        content_by_id: &content_by_id,
        allowed_countries: &allowed_countries,
        stock_country: &stock_country,
    };

    // Step 4: global pool.
    let global_rules: Vec<Box<dyn GlobalRule>> = vec![Box::new(GlobalStockTopReturn { quotes: quote_returns })];
    let mut global_pool = Vec::new();
    let mut global_seen = HashSet::new();
    let mut any_global_succeeded = false;
    for rule in &global_rules {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| rule.apply(&batch_ctx)));
        match result {
            Ok(ids) => {
                any_global_succeeded = true;
                union_preserving_order(&mut global_pool, &mut global_seen, ids);
            }
            Err(payload) => {
                let err = crate::error::EngineError::RuleFailure {
                    rule: rule.name().to_string(),
                    reason: crate::error::panic_reason(&*payload),
                };
                tracing::warn!(error = %err, "global rule panicked; contribution treated as empty");
            }
        }
    }
    if !any_global_succeeded {
        tracing::warn!("every global rule failed; global pool recomputed empty");
    }

    // Step 5: other pool (top-liked content, weighted separately).
    let other_rule = GlobalTopLikeContent;
    let other_pool: Vec<ItemId> = other_rule.apply(&batch_ctx);

    let related_source: Arc<dyn RelatedStockSource> = Arc::new(UnknownRelatedStockSource);
    let local_rules: Vec<Box<dyn LocalRule>> = vec![
        Box::new(LocalMarketContent::default()),
        Box::new(LocalOwnedStockLabel),
        Box::new(LocalSectorContent),
        Box::new(LocalRelatedContent { related_source }),
        Box::new(LocalOnboardingInterest),
    ];

    let portfolio_client = Arc::new(PortfolioClient::new(config.portfolio_api.clone()));
    let semaphore = Arc::new(Semaphore::new(config.effective_batch_workers().max(1)));
    let content_by_id = Arc::new(content_by_id);
    let cf_model = Arc::new(cf_model);
    let interactions = Arc::new(interactions);
    let global_pool = Arc::new(global_pool);
    let other_pool = Arc::new(other_pool);
    let local_rules = Arc::new(local_rules);
    let allowed_countries = Arc::new(allowed_countries);
    let stock_country = Arc::new(stock_country);

    let mut join_set = tokio::task::JoinSet::new();
    for user in users {
        let permit = semaphore.clone().acquire_owned().await?;
        let content_by_id = content_by_id.clone();
        let cf_model = cf_model.clone();
        let interactions = interactions.clone();
        let global_pool = global_pool.clone();
        let other_pool = other_pool.clone();
        let local_rules = local_rules.clone();
        let portfolio_client = portfolio_client.clone();
        let allowed_countries = allowed_countries.clone();
        let stock_country = stock_country.clone();
        let config = config.clone();

        join_set.spawn(async move {
            let _permit = permit;
            let batch_ctx = BatchContext {
                content_by_id: &content_by_id,
                allowed_countries: &allowed_countries,
                stock_country: &stock_country,
            };
            process_user(
                &user,
                &batch_ctx,
                &global_pool,
                &other_pool,
                &local_rules,
                &cf_model,
                &interactions,
                &portfolio_client,
                &config,
            )
            .await
        });
    }

    let mut records = Vec::new();
    let mut skipped = 0usize;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Some(record)) => records.push(record),
            Ok(None) => skipped += 1,
            Err(e) => {
                tracing::warn!(error = %e, "per-user batch task panicked; user skipped");
                skipped += 1;
            }
        }
    }

    let users_processed = records.len();
    let records_saved = if dry_run {
        tracing::info!(candidate_count = records.len(), "dry run: skipping persistence");
        0
    } else {
        let outcome = db.save_candidates(&records, 100).await;
        match outcome {
            crate::db::SaveOutcome::Ok { saved } => saved,
            crate::db::SaveOutcome::Degraded { saved, fallback_records } => {
                tracing::warn!(saved, fallback_records, "batch save degraded: some records fell back to file");
                saved
            }
        }
    };

    Ok(BatchRunSummary {
        users_processed,
        users_skipped: skipped,
        records_saved,
    })
}

#[allow(clippy::too_many_arguments)]
async fn process_user(
    user: &UserProfile,
    batch_ctx: &BatchContext<'_>,
    global_pool: &[ItemId],
    other_pool: &[ItemId],
    local_rules: &[Box<dyn LocalRule>],
    cf_model: &CfModel,
    interactions: &HashMap<String, Vec<ItemId>>,
    portfolio_client: &PortfolioClient,
    config: &Config,
) -> Option<CandidateRecord> {
    let portfolio = portfolio_client.fetch_portfolio(&user.cust_no).await;
    let owned_stocks: HashSet<String> = portfolio.holdings.iter().map(|h| h.label.clone()).collect();

    let mut user_ctx = UserContext::new(user.cust_no.clone());
    user_ctx.owned_stocks = owned_stocks;
    user_ctx.portfolio_data = portfolio;

    let mut local_pool = Vec::new();
    let mut local_seen = HashSet::new();
    for rule in local_rules {
        let result = AssertUnwindSafe(rule.apply(user, &user_ctx, batch_ctx)).catch_unwind().await;
        match result {
            Ok(ids) => union_preserving_order(&mut local_pool, &mut local_seen, ids),
            Err(payload) => {
                let err = crate::error::EngineError::RuleFailure {
                    rule: rule.name().to_string(),
                    reason: crate::error::panic_reason(&*payload),
                };
                tracing::warn!(cust_no = %user.cust_no, error = %err, "local rule panicked; contribution treated as empty");
            }
        }
    }

    let global_set: HashSet<&ItemId> = global_pool.iter().collect();
    let local_set: HashSet<&ItemId> = local_pool.iter().collect();
    let other_set: HashSet<&ItemId> = other_pool.iter().collect();

    let all_ids: HashSet<ItemId> = global_set
        .iter()
        .chain(local_set.iter())
        .chain(other_set.iter())
        .map(|id| (*id).clone())
        .collect();

    if all_ids.is_empty() {
        return None;
    }

    let history: Vec<ItemId> = interactions
        .get(&user.cust_no)
        .map(|h| h.iter().take(config.cf_user_history_limit).cloned().collect())
        .unwrap_or_default();
    let cf_scores = cf_model.get_scores(&history, &all_ids);

    let w = &config.source_weights;
    let mut scored: Vec<(ItemId, f64)> = Vec::with_capacity(all_ids.len());
    for id in all_ids {
        let mut score = 0.0;
        if global_set.contains(&id) {
            score += w.global;
        }
        if local_set.contains(&id) {
            score += w.local;
        }
        if other_set.contains(&id) {
            score += w.other;
        }
        if let Some(cf) = cf_scores.get(&id) {
            score += config.cf_weight * cf;
        }
        if score >= config.min_score_threshold {
            scored.push((id, score));
        }
    }

    if scored.is_empty() {
        return None;
    }

    Some(CandidateRecord::from_scored(
        user.cust_no.clone(),
        scored,
        config.max_candidates_per_user,
        chrono::Utc::now(),
    ))
}

/// Tags a resolved candidate with the pool(s) it was sourced from, for
/// callers that need the attribution rather than just the final score
/// (e.g. offline analysis). Not used by the scoring path itself, which
/// works directly off the three `HashSet`s.
pub fn pools_for(id: &ItemId, global: &[ItemId], local: &[ItemId], other: &[ItemId]) -> Vec<Pool> {
    let mut pools = Vec::new();
    if global.contains(id) {
        pools.push(Pool::Global);
    }
    if local.contains(id) {
        pools.push(Pool::Local);
    }
    if other.contains(id) {
        pools.push(Pool::Other);
    }
    pools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Concern;

    fn make_content(id: &str, label: &str, btopic: &str) -> ContentMeta {
        ContentMeta::new(id).with_label(label).with_btopic(btopic)
    }

    #[tokio::test]
    async fn process_user_combines_source_weights_exactly_i5() {
        let mut content_by_id = HashMap::new();
        content_by_id.insert("c1".to_string(), make_content("c1", "SAMS", "market"));
        let allowed = vec![];
        let stock_country = HashMap::new();
        let batch_ctx = BatchContext {
            content_by_id: &content_by_id,
            allowed_countries: &allowed,
            stock_country: &stock_country,
        };

        let local_rules: Vec<Box<dyn LocalRule>> = vec![Box::new(LocalMarketContent::default())];
        let cf_model = CfModel::new();
        let interactions = HashMap::new();
        let portfolio_client = PortfolioClient::new(crate::config::PortfolioApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            request_timeout_ms: 50,
        });
        let mut config = Config::default();
        config.source_weights.global = 0.0;
        config.source_weights.local = 0.4;
        config.source_weights.other = 0.0;
        config.cf_weight = 0.0;
        config.min_score_threshold = 0.0;

        let user = UserProfile::new("u1");
        let record = process_user(&user, &batch_ctx, &[], &[], &local_rules, &cf_model, &interactions, &portfolio_client, &config)
            .await
            .unwrap();

        assert_eq!(record.curation_list, vec![("c1".to_string(), 0.4)]);
    }

    #[tokio::test]
    async fn process_user_returns_none_when_every_pool_empty() {
        let content_by_id = HashMap::new();
        let allowed = vec![];
        let stock_country = HashMap::new();
        let batch_ctx = BatchContext {
            content_by_id: &content_by_id,
            allowed_countries: &allowed,
            stock_country: &stock_country,
        };
        let local_rules: Vec<Box<dyn LocalRule>> = vec![];
        let cf_model = CfModel::new();
        let interactions = HashMap::new();
        let portfolio_client = PortfolioClient::new(crate::config::PortfolioApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            max_retries: 0,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            request_timeout_ms: 50,
        });
        let config = Config::default();
        let mut user = UserProfile::new("u1");
        user.concerns = vec![Concern { gic_code: "1".to_string(), stk_name: "NOPE".to_string() }];

        let record = process_user(&user, &batch_ctx, &[], &[], &local_rules, &cf_model, &interactions, &portfolio_client, &config).await;
        assert!(record.is_none());
    }
}
