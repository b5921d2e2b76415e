//! Online context fetcher (C5, §4.5).
//!
//! Hydrates a per-request `UserContext` with everything the online rule
//! chains need, fetching independent sub-pieces concurrently. A failure
//! of any single sub-fetch yields its empty default — never a request
//! failure (§4.5, §7).

use crate::config::Config;
use crate::db::Database;
use crate::models::{ContentMeta, ItemId, StockReturn, UserContext};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Externally-provided stock-affinity sets the source stubs out entirely
/// (recent/group1/onboarding loading has no production implementation).
/// Per the spec's open question, this trait names the contract without
/// fabricating defaults: a caller with no real source can supply
/// `NullStockAffinitySource`, which returns empty sets and logs once.
#[async_trait::async_trait]
pub trait StockAffinitySource: Send + Sync {
    async fn owned_stocks(&self, cust_no: &str) -> HashSet<String>;
    async fn recent_stocks(&self, cust_no: &str) -> HashSet<String>;
    async fn group1_stocks(&self, cust_no: &str) -> HashSet<String>;
    async fn onboarding_stocks(&self, cust_no: &str) -> HashSet<String>;
}

/// Default source used when no real upstream is wired in: always empty,
/// logged once per call so the gap is visible rather than silent.
pub struct UnknownStockAffinitySource;

#[async_trait::async_trait]
impl StockAffinitySource for UnknownStockAffinitySource {
    async fn owned_stocks(&self, cust_no: &str) -> HashSet<String> {
        tracing::debug!(cust_no, "owned_stocks: UnknownSource placeholder, returning empty");
        HashSet::new()
    }

    async fn recent_stocks(&self, cust_no: &str) -> HashSet<String> {
        tracing::debug!(cust_no, "recent_stocks: UnknownSource placeholder, returning empty");
        HashSet::new()
    }

    async fn group1_stocks(&self, cust_no: &str) -> HashSet<String> {
        tracing::debug!(cust_no, "group1_stocks: UnknownSource placeholder, returning empty");
        HashSet::new()
    }

    async fn onboarding_stocks(&self, cust_no: &str) -> HashSet<String> {
        tracing::debug!(cust_no, "onboarding_stocks: UnknownSource placeholder, returning empty");
        HashSet::new()
    }
}

/// Fetches everything §4.5 describes except `content_meta`, which is
/// hydrated separately once the candidate ids to consider are known
/// (§4.6 step 5).
pub async fn fetch_user_context(
    db: &Database,
    affinity: &dyn StockAffinitySource,
    config: &Config,
    cust_no: &str,
) -> UserContext {
    let mut ctx = UserContext::new(cust_no.to_string());

    let seen_items_fut = fetch_seen_items(db, config, cust_no);
    let owned_fut = affinity.owned_stocks(cust_no);
    let recent_fut = affinity.recent_stocks(cust_no);
    let group1_fut = affinity.group1_stocks(cust_no);
    let onboarding_fut = affinity.onboarding_stocks(cust_no);

    let (seen_items, owned_stocks, recent_stocks, group1_stocks, onboarding_stocks) =
        tokio::join!(seen_items_fut, owned_fut, recent_fut, group1_fut, onboarding_fut);

    ctx.seen_items = seen_items;
    ctx.owned_stocks = owned_stocks;
    ctx.recent_stocks = recent_stocks;
    ctx.group1_stocks = group1_stocks;
    ctx.onboarding_stocks = onboarding_stocks;

    if !ctx.owned_stocks.is_empty() {
        ctx.owned_stock_returns = fetch_owned_stock_returns(db, config, &ctx.owned_stocks).await;
    }

    ctx
}

async fn fetch_seen_items(db: &Database, config: &Config, cust_no: &str) -> HashSet<ItemId> {
    let timeout = Duration::from_millis(config.interaction_log_timeout_ms);
    let days = config.seen_items_window_days;
    match tokio::time::timeout(timeout * days.max(1), db.load_interactions(days)).await {
        Ok(Ok(mut all)) => all.remove(cust_no).map(|v| v.into_iter().collect()).unwrap_or_default(),
        Ok(Err(e)) => {
            tracing::warn!(cust_no, error = %e, "seen items fetch failed; degrading to empty");
            HashSet::new()
        }
        Err(_) => {
            tracing::warn!(cust_no, "seen items fetch timed out; degrading to empty");
            HashSet::new()
        }
    }
}

async fn fetch_owned_stock_returns(
    db: &Database,
    config: &Config,
    owned_stocks: &HashSet<String>,
) -> HashMap<String, StockReturn> {
    let timeout = Duration::from_millis(config.quote_timeout_ms);
    let fetch = db.fetch_latest_quotes(1, owned_stocks.len().max(1) * 2, &[]);

    let quotes = match tokio::time::timeout(timeout, fetch).await {
        Ok(Ok(quotes)) => quotes,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "owned stock returns fetch failed; degrading to empty");
            return HashMap::new();
        }
        Err(_) => {
            tracing::warn!("owned stock returns fetch timed out; degrading to empty");
            return HashMap::new();
        }
    };

    let mut out = HashMap::new();
    for q in quotes {
        if owned_stocks.contains(&q.code) {
            out.insert(
                q.code.clone(),
                StockReturn {
                    one_day: q.one_day_return,
                    one_month: q.one_month_return,
                },
            );
        }
    }
    out
}

/// A fixed-map implementation for callers that do have a real upstream
/// (e.g. a nightly export loaded into memory) but not one this crate
/// should assume the shape of. Each set defaults to empty when the
/// customer has no entry.
#[derive(Default)]
pub struct StaticStockAffinitySource {
    pub owned: HashMap<String, HashSet<String>>,
    pub recent: HashMap<String, HashSet<String>>,
    pub group1: HashMap<String, HashSet<String>>,
    pub onboarding: HashMap<String, HashSet<String>>,
}

#[async_trait::async_trait]
impl StockAffinitySource for StaticStockAffinitySource {
    async fn owned_stocks(&self, cust_no: &str) -> HashSet<String> {
        self.owned.get(cust_no).cloned().unwrap_or_default()
    }

    async fn recent_stocks(&self, cust_no: &str) -> HashSet<String> {
        self.recent.get(cust_no).cloned().unwrap_or_default()
    }

    async fn group1_stocks(&self, cust_no: &str) -> HashSet<String> {
        self.group1.get(cust_no).cloned().unwrap_or_default()
    }

    async fn onboarding_stocks(&self, cust_no: &str) -> HashSet<String> {
        self.onboarding.get(cust_no).cloned().unwrap_or_default()
    }
}

/// Second hydration step (§4.5): fetch content metadata for specific
/// candidate ids once the pipeline knows which ones survive pre-filter.
pub async fn fetch_content_meta(db: &Database, item_ids: &[ItemId]) -> HashMap<ItemId, ContentMeta> {
    if item_ids.is_empty() {
        return HashMap::new();
    }
    match db.load_contents().await {
        Ok(all) => all
            .into_iter()
            .filter(|c| item_ids.contains(&c.item_id))
            .map(|c| (c.item_id.clone(), c))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "content metadata fetch failed; degrading to empty");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_source_returns_empty_sets() {
        let source = UnknownStockAffinitySource;
        assert!(source.recent_stocks("u1").await.is_empty());
        assert!(source.group1_stocks("u1").await.is_empty());
        assert!(source.onboarding_stocks("u1").await.is_empty());
    }

    #[tokio::test]
    async fn fetch_content_meta_empty_ids_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let out = fetch_content_meta(&db, &[]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn fetch_owned_stock_returns_populates_one_month() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let today = chrono::Utc::now().format("%Y%m%d").to_string();
        db.insert_quote(&crate::db::QuoteRow {
            code: "SAMS".to_string(),
            country: "Korea".to_string(),
            one_day_return: Some(1.5),
            one_month_return: Some(4.2),
            market_cap: Some(1000.0),
            quote_date: today,
        })
        .await
        .unwrap();

        let config = Config::default();
        let owned = HashSet::from(["SAMS".to_string()]);
        let returns = fetch_owned_stock_returns(&db, &config, &owned).await;
        let r = returns.get("SAMS").unwrap();
        assert_eq!(r.one_day, Some(1.5));
        assert_eq!(r.one_month, Some(4.2));
    }
}
