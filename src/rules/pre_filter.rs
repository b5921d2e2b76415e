//! Pre-filter rules (online, §4.6).

use super::PreFilterRule;
use crate::models::{ItemId, UserContext};
use async_trait::async_trait;

/// Removes any id present in `seen_items`. No-op if `seen_items` is empty.
/// Idempotent by construction (I2): filtering twice removes nothing extra
/// the second time since the removed ids are already gone.
pub struct ExcludeSeenItems;

#[async_trait]
impl PreFilterRule for ExcludeSeenItems {
    fn name(&self) -> &'static str {
        "ExcludeSeenItems"
    }

    async fn apply(&self, ctx: &UserContext, candidates: Vec<ItemId>) -> Vec<ItemId> {
        if ctx.seen_items.is_empty() {
            return candidates;
        }
        let before = candidates.len();
        let filtered: Vec<ItemId> = candidates
            .into_iter()
            .filter(|id| !ctx.seen_items.contains(id))
            .collect();
        tracing::debug!(
            rule = self.name(),
            cust_no = %ctx.cust_no,
            input_size = before,
            output_size = filtered.len(),
            "filtered seen items"
        );
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn removes_seen_items() {
        let mut ctx = UserContext::new("u1");
        ctx.seen_items = HashSet::from(["b".to_string()]);
        let rule = ExcludeSeenItems;
        let out = rule
            .apply(
                &ctx,
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await;
        assert_eq!(out, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn noop_when_seen_items_empty() {
        let ctx = UserContext::new("u1");
        let rule = ExcludeSeenItems;
        let input = vec!["a".to_string(), "b".to_string()];
        let out = rule.apply(&ctx, input.clone()).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn idempotent_applying_twice_matches_once() {
        let mut ctx = UserContext::new("u1");
        ctx.seen_items = HashSet::from(["b".to_string()]);
        let rule = ExcludeSeenItems;
        let input = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let once = rule.apply(&ctx, input.clone()).await;
        let twice = rule.apply(&ctx, once.clone()).await;
        assert_eq!(once, twice);
    }
}
