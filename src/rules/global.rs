//! Global rules (batch, §4.4 step 4). Independent of any single user.

use super::{BatchContext, GlobalRule};
use crate::models::ItemId;

/// Top 10 content by 1-day return among Korea/USA-listed stocks, matched
/// by content `label`. Grounded on the source's `GlobalStockTopReturnRule`.
pub struct GlobalStockTopReturn {
    pub quotes: Vec<QuoteReturn>,
}

/// A minimal quote projection this rule needs, decoupled from the DB row
/// shape so it can be constructed directly in tests.
#[derive(Debug, Clone)]
pub struct QuoteReturn {
    pub code: String,
    pub country: String,
    pub one_day_return: Option<f64>,
}

impl GlobalRule for GlobalStockTopReturn {
    fn name(&self) -> &'static str {
        "GlobalStockTopReturn"
    }

    fn apply(&self, ctx: &BatchContext<'_>) -> Vec<ItemId> {
        if self.quotes.is_empty() {
            return Vec::new();
        }

        let mut filtered: Vec<&QuoteReturn> = self
            .quotes
            .iter()
            .filter(|q| ctx.allowed_countries.iter().any(|c| c == &q.country))
            .collect();
        filtered.sort_by(|a, b| {
            let ra = a.one_day_return.unwrap_or(0.0);
            let rb = b.one_day_return.unwrap_or(0.0);
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_codes: std::collections::HashSet<&str> =
            filtered.into_iter().take(10).map(|q| q.code.as_str()).collect();

        ctx.content_by_id
            .values()
            .filter(|meta| top_codes.contains(meta.label.as_str()))
            .map(|meta| meta.item_id.clone())
            .collect()
    }
}

/// Top 10 content by liked-user count. Spec designates this as the "other"
/// pool's sole source (§4.4 step 5), kept separate from the generic global
/// pool because it is weighted differently in score combination.
pub struct GlobalTopLikeContent;

impl GlobalRule for GlobalTopLikeContent {
    fn name(&self) -> &'static str {
        "GlobalTopLikeContent"
    }

    fn apply(&self, ctx: &BatchContext<'_>) -> Vec<ItemId> {
        let mut contents: Vec<_> = ctx.content_by_id.values().collect();
        contents.sort_by(|a, b| b.liked_users.len().cmp(&a.liked_users.len()));
        contents.into_iter().take(10).map(|m| m.item_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentMeta;
    use std::collections::HashMap;

    fn empty_ctx<'a>(content: &'a HashMap<ItemId, ContentMeta>, countries: &'a [String], stock_country: &'a HashMap<String, String>) -> BatchContext<'a> {
        BatchContext {
            content_by_id: content,
            allowed_countries: countries,
            stock_country,
        }
    }

    #[test]
    fn top_return_matches_content_by_label() {
        let mut content = HashMap::new();
        content.insert(
            "c1".to_string(),
            ContentMeta::new("c1").with_label("SAMS"),
        );
        content.insert(
            "c2".to_string(),
            ContentMeta::new("c2").with_label("NOTOP"),
        );
        let countries = vec!["Korea".to_string(), "USA".to_string()];
        let stock_country = HashMap::new();
        let ctx = empty_ctx(&content, &countries, &stock_country);

        let rule = GlobalStockTopReturn {
            quotes: vec![
                QuoteReturn { code: "SAMS".to_string(), country: "Korea".to_string(), one_day_return: Some(5.0) },
                QuoteReturn { code: "NOTOP".to_string(), country: "Korea".to_string(), one_day_return: Some(-3.0) },
            ],
        };
        let out = rule.apply(&ctx);
        assert_eq!(out, vec!["c1".to_string()]);
    }

    #[test]
    fn top_like_content_orders_by_liked_user_count() {
        let mut content = HashMap::new();
        let mut popular = ContentMeta::new("popular");
        popular.liked_users = std::collections::HashSet::from(["u1".to_string(), "u2".to_string()]);
        let mut quiet = ContentMeta::new("quiet");
        quiet.liked_users = std::collections::HashSet::from(["u1".to_string()]);
        content.insert("popular".to_string(), popular);
        content.insert("quiet".to_string(), quiet);

        let countries = vec![];
        let stock_country = HashMap::new();
        let ctx = empty_ctx(&content, &countries, &stock_country);
        let rule = GlobalTopLikeContent;
        let out = rule.apply(&ctx);
        assert_eq!(out[0], "popular");
    }

    #[test]
    fn empty_quotes_yields_empty_candidates() {
        let content = HashMap::new();
        let countries = vec![];
        let stock_country = HashMap::new();
        let ctx = empty_ctx(&content, &countries, &stock_country);
        let rule = GlobalStockTopReturn { quotes: vec![] };
        assert!(rule.apply(&ctx).is_empty());
    }
}
