//! End-to-end integration test: seed a database, run one batch pass, then
//! serve an online ranking request against the candidates it persisted.

use curation_engine::batch::run_batch;
use curation_engine::config::Config;
use curation_engine::context::UnknownStockAffinitySource;
use curation_engine::db::Database;
use curation_engine::models::{ContentMeta, UserProfile};
use curation_engine::ranking::RankingEngine;

async fn seed(db: &Database) {
    db.upsert_user(&UserProfile::new("u1")).await.unwrap();
    db.upsert_user(&UserProfile::new("u2")).await.unwrap();

    db.upsert_content(&ContentMeta::new("market-a").with_btopic("market"))
        .await
        .unwrap();
    db.upsert_content(&ContentMeta::new("market-b").with_btopic("market"))
        .await
        .unwrap();
    db.upsert_content(&ContentMeta::new("unrelated").with_btopic("lifestyle"))
        .await
        .unwrap();
}

#[tokio::test]
async fn batch_run_persists_candidates_that_online_ranking_can_serve() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("integration.db").to_str().unwrap()).unwrap();
    seed(&db).await;

    let mut config = Config::default();
    config.source_weights.global = 0.0;
    config.source_weights.local = 1.0;
    config.source_weights.other = 0.0;
    config.cf_weight = 0.0;
    config.min_score_threshold = 0.0;
    config.noise_level = 0.0;
    config.portfolio_api.base_url = "http://127.0.0.1:1/unreachable".to_string();
    config.portfolio_api.max_retries = 0;
    config.portfolio_api.request_timeout_ms = 50;

    let summary = run_batch(&db, &config).await.unwrap();
    assert_eq!(summary.users_processed, 2);
    assert!(summary.records_saved >= 2);

    let record = db.get_candidate_record("u1").await.unwrap().unwrap();
    let ids: Vec<&str> = record.curation_list.iter().map(|(id, _)| id.as_str()).collect();
    assert!(ids.contains(&"market-a"));
    assert!(ids.contains(&"market-b"));
    assert!(!ids.contains(&"unrelated"));

    let engine = RankingEngine::new(&config);
    let affinity = UnknownStockAffinitySource;
    let result = engine.rank(&db, &affinity, &config, "u1").await;
    let ranked_ids: Vec<&str> = result.ranked.iter().map(|(id, _)| id.as_str()).collect();
    assert!(ranked_ids.contains(&"market-a"));
    assert!(ranked_ids.contains(&"market-b"));
}

#[tokio::test]
async fn batch_run_with_no_users_saves_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("empty.db").to_str().unwrap()).unwrap();
    let config = Config::default();

    let summary = run_batch(&db, &config).await.unwrap();
    assert_eq!(summary.users_processed, 0);
    assert_eq!(summary.records_saved, 0);
}
