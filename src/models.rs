//! Core data model (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque stable customer identifier. Stored as a string to preserve
/// leading zeros in the numeric domain it is usually drawn from.
pub type CustomerId = String;

/// Opaque content identifier, distinct from the content's stock label.
pub type ItemId = String;

/// A market-listed security symbol.
pub type StockCode = String;

/// Pool a candidate id was sourced from; drives scoring weights (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    Global,
    Local,
    Other,
}

/// Immutable content metadata, shared by batch and online paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMeta {
    pub item_id: ItemId,
    /// Stock code the content is tied to, or empty if none.
    pub label: String,
    pub btopic: String,
    pub stopic: String,
    pub sector: String,
    pub liked_users: HashSet<CustomerId>,
    pub market_cap: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ContentMeta {
    pub fn new(item_id: impl Into<ItemId>) -> Self {
        Self {
            item_id: item_id.into(),
            label: String::new(),
            btopic: String::new(),
            stopic: String::new(),
            sector: String::new(),
            liked_users: HashSet::new(),
            market_cap: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_btopic(mut self, btopic: impl Into<String>) -> Self {
        self.btopic = btopic.into();
        self
    }
}

/// A single onboarding/interest concern drawn from a user's profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concern {
    pub gic_code: String,
    pub stk_name: String,
}

/// Mutable, externally-owned user profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub cust_no: CustomerId,
    pub concerns: Vec<Concern>,
    pub last_login_dt: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn new(cust_no: impl Into<CustomerId>) -> Self {
        Self {
            cust_no: cust_no.into(),
            concerns: Vec::new(),
            last_login_dt: None,
        }
    }
}

/// 1-day / 1-month return pair for a stock, used by `BoostTopReturnStock`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StockReturn {
    pub one_day: Option<f64>,
    pub one_month: Option<f64>,
}

/// Portfolio snapshot returned (or not) by the external portfolio API.
/// Absence/degradation is represented as `PortfolioData::default()`, never
/// as an error — §4.2's `FetchPortfolio` contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioData {
    pub holdings: Vec<PortfolioHolding>,
    pub sector_weight: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioHolding {
    pub label: StockCode,
    pub sector: String,
    pub gic_code: String,
}

/// Ephemeral, per-request context (§3's `UserContext`). Owned by a single
/// request and discarded on reply; never shared across requests.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub cust_no: CustomerId,
    pub seen_items: HashSet<ItemId>,
    pub owned_stocks: HashSet<StockCode>,
    pub recent_stocks: HashSet<StockCode>,
    pub group1_stocks: HashSet<StockCode>,
    pub onboarding_stocks: HashSet<StockCode>,
    pub owned_stock_returns: HashMap<StockCode, StockReturn>,
    pub content_meta: HashMap<ItemId, ContentMeta>,
    pub portfolio_data: PortfolioData,
}

impl UserContext {
    pub fn new(cust_no: impl Into<CustomerId>) -> Self {
        Self {
            cust_no: cust_no.into(),
            ..Default::default()
        }
    }

    /// `true` when none of the four stock-affinity sets carry any entries,
    /// mirroring the source's `if not any([...])` early-out.
    pub fn has_no_stock_affinity(&self) -> bool {
        self.owned_stocks.is_empty()
            && self.recent_stocks.is_empty()
            && self.group1_stocks.is_empty()
            && self.onboarding_stocks.is_empty()
    }
}

/// The persisted batch output, one per customer (§3, §6).
///
/// Invariants enforced by construction (`CandidateRecord::from_scored`):
/// sorted descending by score, capped at `MAX_CANDIDATES_PER_USER`, unique
/// item ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub cust_no: CustomerId,
    pub curation_list: Vec<(ItemId, f64)>,
    pub create_dt: DateTime<Utc>,
    pub modi_dt: DateTime<Utc>,
}

impl CandidateRecord {
    /// Build a record from unsorted, possibly-duplicated `(item, score)`
    /// pairs, enforcing I1: sort desc by score (ties by id asc), dedupe
    /// keeping the first occurrence, and truncate to `max_candidates`.
    pub fn from_scored(
        cust_no: impl Into<CustomerId>,
        mut items: Vec<(ItemId, f64)>,
        max_candidates: usize,
        create_dt: DateTime<Utc>,
    ) -> Self {
        let mut seen = HashSet::with_capacity(items.len());
        items.retain(|(id, _)| seen.insert(id.clone()));
        sort_scored_desc(&mut items);
        items.truncate(max_candidates);
        let now = Utc::now();
        Self {
            cust_no: cust_no.into(),
            curation_list: items,
            create_dt,
            modi_dt: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.curation_list.is_empty()
    }
}

/// Sort `(id, score)` pairs descending by score, ties broken by id ascending.
/// Shared by batch score combination and every online re-sort point (§4.4.1, §4.6).
pub fn sort_scored_desc(items: &mut [(ItemId, f64)]) {
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_scored_sorts_dedupes_and_truncates() {
        let record = CandidateRecord::from_scored(
            "u1",
            vec![
                ("a".to_string(), 1.0),
                ("b".to_string(), 3.0),
                ("a".to_string(), 9.0), // duplicate, first occurrence wins
                ("c".to_string(), 3.0),
            ],
            2,
            Utc::now(),
        );
        assert_eq!(record.curation_list.len(), 2);
        assert_eq!(record.curation_list[0].0, "b");
        assert_eq!(record.curation_list[1].0, "c");
    }

    #[test]
    fn sort_scored_desc_breaks_ties_by_id_ascending() {
        let mut items = vec![
            ("z".to_string(), 1.0),
            ("a".to_string(), 1.0),
            ("m".to_string(), 2.0),
        ];
        sort_scored_desc(&mut items);
        assert_eq!(items[0].0, "m");
        assert_eq!(items[1].0, "a");
        assert_eq!(items[2].0, "z");
    }

    #[test]
    fn has_no_stock_affinity_detects_all_empty() {
        let ctx = UserContext::new("u1");
        assert!(ctx.has_no_stock_affinity());
    }
}
