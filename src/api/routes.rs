//! HTTP handlers for the online recommendation surface (§4.6, §4.7).

use axum::{
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    /// Overrides `config.recommendation_count` for this request only.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecommendationItem {
    pub item_id: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct RecommendationResponse {
    pub cust_no: String,
    pub items: Vec<RecommendationItem>,
    pub count: usize,
}

/// `GET /api/recommendations/:cust_no` — runs the coalesced ranking
/// pipeline for a known customer (§4.6, §4.7).
pub async fn get_recommendations(
    Path(cust_no): Path<String>,
    Query(params): Query<RecommendationQuery>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<RecommendationResponse>, StatusCode> {
    let Some(result) = state.coalescer.request(cust_no.clone()).await else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let mut items: Vec<RecommendationItem> = result
        .ranked
        .into_iter()
        .map(|(item_id, score)| RecommendationItem { item_id, score })
        .collect();
    if let Some(limit) = params.limit {
        items.truncate(limit);
    }

    Ok(Json(RecommendationResponse {
        count: items.len(),
        cust_no,
        items,
    }))
}

#[derive(Debug, Serialize)]
pub struct AnonymousRecommendationResponse {
    pub items: Vec<String>,
    pub count: usize,
}

/// `GET /api/recommendations/anonymous` — bypasses the coalescer entirely
/// and returns a shuffled prefix of the fixed anonymous list (§4.7).
pub async fn get_anonymous_recommendations(
    AxumState(state): AxumState<AppState>,
) -> Json<AnonymousRecommendationResponse> {
    let items = curation_engine::coalesce::anonymous_recommendations(&state.db, state.config.recommendation_count).await;
    Json(AnonymousRecommendationResponse { count: items.len(), items })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// `GET /ready` — readiness probe: liveness plus a round-trip against the
/// backing store, so a load balancer can distinguish "process up" from
/// "process up but can't serve requests" (§4.8).
pub async fn readiness_check(AxumState(state): AxumState<AppState>) -> impl IntoResponse {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ready" })),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed: backing store unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "unavailable" }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_check_reports_ok() {
        let Json(body) = health_check().await;
        assert_eq!(body.status, "ok");
    }
}
