//! Local rules (batch, §4.4 step 6). Per-user candidate pools.

use super::{BatchContext, LocalRule};
use crate::models::{ItemId, UserContext, UserProfile};
use async_trait::async_trait;

/// Content whose broad topic is "market" coverage. Grounded on the
/// source's `LocalMarketContentRule`, which filters by a fixed `btopic`
/// value independent of the user.
pub struct LocalMarketContent {
    pub market_btopic: String,
}

impl Default for LocalMarketContent {
    fn default() -> Self {
        Self {
            market_btopic: "market".to_string(),
        }
    }
}

#[async_trait]
impl LocalRule for LocalMarketContent {
    fn name(&self) -> &'static str {
        "LocalMarketContent"
    }

    async fn apply(&self, _user: &UserProfile, _user_ctx: &UserContext, batch_ctx: &BatchContext<'_>) -> Vec<ItemId> {
        batch_ctx
            .content_by_id
            .values()
            .filter(|meta| meta.btopic == self.market_btopic)
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}

/// Content labeled with a stock the user owns. Grounded on
/// `LocalOwnedStockLabelRule`.
pub struct LocalOwnedStockLabel;

#[async_trait]
impl LocalRule for LocalOwnedStockLabel {
    fn name(&self) -> &'static str {
        "LocalOwnedStockLabel"
    }

    async fn apply(&self, _user: &UserProfile, user_ctx: &UserContext, batch_ctx: &BatchContext<'_>) -> Vec<ItemId> {
        if user_ctx.owned_stocks.is_empty() {
            return Vec::new();
        }
        batch_ctx
            .content_by_id
            .values()
            .filter(|meta| !meta.label.is_empty() && user_ctx.owned_stocks.contains(&meta.label))
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}

/// Content whose stock shares a sector with one of the user's owned
/// stocks. Grounded on `LocalSectorThemeContentRule`, narrowed to the
/// sector comparison since the spec's data model carries `sector` but not
/// the source's separate theme tagging.
pub struct LocalSectorContent;

#[async_trait]
impl LocalRule for LocalSectorContent {
    fn name(&self) -> &'static str {
        "LocalSectorContent"
    }

    async fn apply(&self, _user: &UserProfile, user_ctx: &UserContext, batch_ctx: &BatchContext<'_>) -> Vec<ItemId> {
        if user_ctx.owned_stocks.is_empty() {
            return Vec::new();
        }

        let owned_sectors: std::collections::HashSet<&str> = batch_ctx
            .content_by_id
            .values()
            .filter(|meta| user_ctx.owned_stocks.contains(&meta.label))
            .map(|meta| meta.sector.as_str())
            .filter(|s| !s.is_empty())
            .collect();

        if owned_sectors.is_empty() {
            return Vec::new();
        }

        batch_ctx
            .content_by_id
            .values()
            .filter(|meta| !meta.label.is_empty() && owned_sectors.contains(meta.sector.as_str()))
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}

/// Looks up stocks related to a given stock, for `LocalRelatedContent`.
/// Kept as an injectable trait so batch runs can be tested without a real
/// upstream, mirroring `StockAffinitySource` in `context.rs`.
#[async_trait]
pub trait RelatedStockSource: Send + Sync {
    async fn related_stocks(&self, stock: &str) -> std::collections::HashSet<String>;
}

/// Default source used when no real upstream is wired in: always empty,
/// logged once per call so the gap is visible rather than silent.
pub struct UnknownRelatedStockSource;

#[async_trait]
impl RelatedStockSource for UnknownRelatedStockSource {
    async fn related_stocks(&self, stock: &str) -> std::collections::HashSet<String> {
        tracing::debug!(stock, "related_stocks: UnknownSource placeholder, returning empty");
        std::collections::HashSet::new()
    }
}

/// Content labeled with a stock related to one the user owns. Grounded on
/// `LocalRelatedContentRule`; relatedness itself comes from
/// `RelatedStockSource` rather than this rule, since the source computes it
/// against an external stock-graph service this implementation has no
/// equivalent store for.
pub struct LocalRelatedContent {
    pub related_source: std::sync::Arc<dyn RelatedStockSource>,
}

#[async_trait]
impl LocalRule for LocalRelatedContent {
    fn name(&self) -> &'static str {
        "LocalRelatedContent"
    }

    async fn apply(&self, _user: &UserProfile, user_ctx: &UserContext, batch_ctx: &BatchContext<'_>) -> Vec<ItemId> {
        if user_ctx.owned_stocks.is_empty() {
            return Vec::new();
        }

        let mut related = std::collections::HashSet::new();
        for stock in &user_ctx.owned_stocks {
            related.extend(self.related_source.related_stocks(stock).await);
        }
        if related.is_empty() {
            return Vec::new();
        }

        batch_ctx
            .content_by_id
            .values()
            .filter(|meta| !meta.label.is_empty() && related.contains(&meta.label))
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}

/// Content matching the user's onboarding interests (`concerns`), compared
/// against both `label` and `btopic`. Grounded on
/// `LocalOnboardingInterestRule`.
pub struct LocalOnboardingInterest;

#[async_trait]
impl LocalRule for LocalOnboardingInterest {
    fn name(&self) -> &'static str {
        "LocalOnboardingInterest"
    }

    async fn apply(&self, user: &UserProfile, _user_ctx: &UserContext, batch_ctx: &BatchContext<'_>) -> Vec<ItemId> {
        if user.concerns.is_empty() {
            return Vec::new();
        }
        let interests: std::collections::HashSet<&str> =
            user.concerns.iter().map(|c| c.stk_name.as_str()).filter(|s| !s.is_empty()).collect();
        if interests.is_empty() {
            return Vec::new();
        }

        batch_ctx
            .content_by_id
            .values()
            .filter(|meta| interests.contains(meta.label.as_str()) || interests.contains(meta.btopic.as_str()))
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}
