//! Rule abstraction (C1, §4.1).
//!
//! Four typed rule families. All rules are pure functions of their inputs
//! plus a shared, read-only context; none may mutate their inputs. Stages
//! compose rules as an explicit ordered `Vec<Box<dyn ...>>` rather than a
//! decorator-registry — composition order is a code-level contract, per
//! the redesign note on rule plugin models.

pub mod global;
pub mod local;
pub mod post_reorder;
pub mod pre_filter;

use crate::models::{ContentMeta, ItemId, UserContext, UserProfile};
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-only data shared across a single batch run: the CF-independent
/// inputs every global/local rule needs but none of them owns.
pub struct BatchContext<'a> {
    pub content_by_id: &'a HashMap<ItemId, ContentMeta>,
    pub allowed_countries: &'a [String],
    pub stock_country: &'a HashMap<String, String>,
}

/// `GlobalRule`: `(context) → list<ItemId>`. Independent of any single user.
pub trait GlobalRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, ctx: &BatchContext<'_>) -> Vec<ItemId>;
}

/// `LocalRule`: `(user, context) → list<ItemId>`. Produces a per-user pool.
#[async_trait]
pub trait LocalRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(
        &self,
        user: &UserProfile,
        user_ctx: &UserContext,
        batch_ctx: &BatchContext<'_>,
    ) -> Vec<ItemId>;
}

/// `PreFilterRule` (online): `(user_context, candidates) → candidates`.
/// May only remove or reorder ids, never introduce new ones.
#[async_trait]
pub trait PreFilterRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, ctx: &UserContext, candidates: Vec<ItemId>) -> Vec<ItemId>;
}

/// `PostReorderRule` (online): `(user_context, ranked) → ranked`. May
/// rescore and reorder; must never introduce or drop ids (programming
/// error if violated — §4.6).
#[async_trait]
pub trait PostReorderRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, ctx: &UserContext, ranked: Vec<(ItemId, f64)>) -> Vec<(ItemId, f64)>;
}

/// Union a rule's output into an ordered set, preserving first-seen order
/// (§4.4 step 4's "union ... preserving first-seen order").
pub fn union_preserving_order(dest: &mut Vec<ItemId>, seen: &mut std::collections::HashSet<ItemId>, new_ids: Vec<ItemId>) {
    for id in new_ids {
        if seen.insert(id.clone()) {
            dest.push(id);
        }
    }
}
