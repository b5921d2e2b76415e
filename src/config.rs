//! Typed configuration surface.
//!
//! Layered the way the reference backend layers its performance config:
//! a `Default` impl for every field, `Config::load` for TOML files, and
//! `Config::from_env()` overlaying environment variables (via `dotenv` in
//! development) on top of file-or-default values. Nothing here is fatal
//! except an explicitly-required value that fails to parse.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceWeights {
    #[serde(default = "default_weight_global")]
    pub global: f64,
    #[serde(default = "default_weight_local")]
    pub local: f64,
    #[serde(default = "default_weight_other")]
    pub other: f64,
}

fn default_weight_global() -> f64 {
    0.1
}
fn default_weight_local() -> f64 {
    0.1
}
fn default_weight_other() -> f64 {
    0.1
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            global: default_weight_global(),
            local: default_weight_local(),
            other: default_weight_other(),
        }
    }
}

/// Per-rule boost factors for `BoostUserStocks` (§4.6). Kept adjustable
/// rather than hardcoded since the source comments flag them as tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostWeights {
    #[serde(default = "default_boost_owned")]
    pub owned: f64,
    #[serde(default = "default_boost_recent")]
    pub recent: f64,
    #[serde(default = "default_boost_group1")]
    pub group1: f64,
    #[serde(default = "default_boost_onboarding")]
    pub onboarding: f64,
}

fn default_boost_owned() -> f64 {
    1.5
}
fn default_boost_recent() -> f64 {
    1.3
}
fn default_boost_group1() -> f64 {
    1.2
}
fn default_boost_onboarding() -> f64 {
    1.1
}

impl Default for BoostWeights {
    fn default() -> Self {
        Self {
            owned: default_boost_owned(),
            recent: default_boost_recent(),
            group1: default_boost_group1(),
            onboarding: default_boost_onboarding(),
        }
    }
}

/// Component weights for `MarketCapRecencyRandom` (§4.6). The spec's
/// default is an equal weighting of all four z-scored components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCapRecencyWeights {
    #[serde(default = "default_component_weight")]
    pub score: f64,
    #[serde(default = "default_component_weight")]
    pub market_cap: f64,
    #[serde(default = "default_component_weight")]
    pub recency: f64,
    #[serde(default = "default_component_weight")]
    pub noise: f64,
}

fn default_component_weight() -> f64 {
    1.0
}

impl Default for MarketCapRecencyWeights {
    fn default() -> Self {
        Self {
            score: default_component_weight(),
            market_cap: default_component_weight(),
            recency: default_component_weight(),
            noise: default_component_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioApiConfig {
    #[serde(default = "default_portfolio_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_portfolio_url() -> String {
    "http://localhost:9999/api/mu800".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    2_000
}

impl Default for PortfolioApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_portfolio_url(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the online HTTP server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path to the SQLite-backed document/candidate store.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Per-pool scoring weights (§4.4.1).
    #[serde(default)]
    pub source_weights: SourceWeights,

    /// Weight applied to the collaborative-filtering score (§4.4.1). May be zero.
    #[serde(default = "default_cf_weight")]
    pub cf_weight: f64,

    /// Accepted but unused by the required core (content-based signal).
    #[serde(default = "default_cb_weight")]
    pub cb_weight: f64,

    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    #[serde(default = "default_max_candidates_per_user")]
    pub max_candidates_per_user: usize,

    #[serde(default = "default_cf_user_history_limit")]
    pub cf_user_history_limit: usize,

    #[serde(default = "default_cf_min_co_occurrence")]
    pub cf_min_co_occurrence: usize,

    #[serde(default = "default_recommendation_count")]
    pub recommendation_count: usize,

    /// Coalescer dispatcher wake-up cadence, in seconds.
    #[serde(default = "default_coalesce_interval_secs")]
    pub coalesce_interval_secs: u64,

    /// Number of time-partitioned interaction-log days scanned for seen items.
    #[serde(default = "default_seen_items_window_days")]
    pub seen_items_window_days: u32,

    /// Number of interaction-log days scanned when building the CF model
    /// and per-user history for batch scoring.
    #[serde(default = "default_cf_interactions_window_days")]
    pub cf_interactions_window_days: u32,

    /// Per-index timeout for seen-item log scans, in milliseconds (~500ms per spec).
    #[serde(default = "default_interaction_log_timeout_ms")]
    pub interaction_log_timeout_ms: u64,

    /// Per-stock timeout for owned-stock return lookups (~800ms per spec).
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,

    /// Bounded worker-pool size for batch per-user parallelism. 0 means "use available cores".
    #[serde(default)]
    pub batch_workers: usize,

    /// Countries `GlobalStockTopReturn` and the quote fetch restrict to (§4.1, §4.4).
    #[serde(default = "default_allowed_countries")]
    pub allowed_countries: Vec<String>,

    #[serde(default)]
    pub boost_weights: BoostWeights,

    #[serde(default)]
    pub market_cap_recency_weights: MarketCapRecencyWeights,

    #[serde(default = "default_top_return_boost_factor")]
    pub top_return_boost_factor: f64,

    #[serde(default = "default_noise_level")]
    pub noise_level: f64,

    #[serde(default)]
    pub portfolio_api: PortfolioApiConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_database_path() -> String {
    "curation_engine.db".to_string()
}
fn default_cf_weight() -> f64 {
    0.0
}
fn default_cb_weight() -> f64 {
    0.0
}
fn default_min_score_threshold() -> f64 {
    0.0
}
fn default_max_candidates_per_user() -> usize {
    500
}
fn default_cf_user_history_limit() -> usize {
    100
}
fn default_cf_min_co_occurrence() -> usize {
    2
}
fn default_recommendation_count() -> usize {
    20
}
fn default_coalesce_interval_secs() -> u64 {
    1
}
fn default_seen_items_window_days() -> u32 {
    3
}
fn default_cf_interactions_window_days() -> u32 {
    30
}
fn default_interaction_log_timeout_ms() -> u64 {
    500
}
fn default_quote_timeout_ms() -> u64 {
    800
}
fn default_top_return_boost_factor() -> f64 {
    2.0
}
fn default_noise_level() -> f64 {
    0.01
}
fn default_allowed_countries() -> Vec<String> {
    vec!["Korea".to_string(), "USA".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            source_weights: SourceWeights::default(),
            cf_weight: default_cf_weight(),
            cb_weight: default_cb_weight(),
            min_score_threshold: default_min_score_threshold(),
            max_candidates_per_user: default_max_candidates_per_user(),
            cf_user_history_limit: default_cf_user_history_limit(),
            cf_min_co_occurrence: default_cf_min_co_occurrence(),
            recommendation_count: default_recommendation_count(),
            coalesce_interval_secs: default_coalesce_interval_secs(),
            seen_items_window_days: default_seen_items_window_days(),
            cf_interactions_window_days: default_cf_interactions_window_days(),
            interaction_log_timeout_ms: default_interaction_log_timeout_ms(),
            quote_timeout_ms: default_quote_timeout_ms(),
            batch_workers: 0,
            allowed_countries: default_allowed_countries(),
            boost_weights: BoostWeights::default(),
            market_cap_recency_weights: MarketCapRecencyWeights::default(),
            top_return_boost_factor: default_top_return_boost_factor(),
            noise_level: default_noise_level(),
            portfolio_api: PortfolioApiConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML file into a `Config` without validating it. Used by
    /// `from_env`'s fallback path, where a malformed file should fall back
    /// to defaults rather than fail outright.
    fn parse_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from a TOML file. Fatal (`ConfigMissing`) if the file parses
    /// but contains a value the engine cannot start with, per §7's
    /// "`ConfigMissing` (fatal at startup)".
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `CURATION_CONFIG_PATH` (default `curation_engine.toml`), falling
    /// back to defaults when the file is absent or malformed, then overlay a
    /// handful of environment variables that operators commonly override
    /// without editing the file. The merged result is always validated, so
    /// an env override cannot silently produce an unstartable config either.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let path = std::env::var("CURATION_CONFIG_PATH")
            .unwrap_or_else(|_| "curation_engine.toml".to_string());

        let mut config = Self::parse_file(&path).unwrap_or_else(|e| {
            tracing::debug!("using default config ({}): {}", path, e);
            Self::default()
        });

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(db) = std::env::var("DATABASE_PATH") {
            config.database_path = db;
        }
        if let Ok(url) = std::env::var("PORTFOLIO_API_URL") {
            config.portfolio_api.base_url = url;
        }
        if let Ok(workers) = std::env::var("BATCH_WORKERS") {
            config.batch_workers = workers.parse().unwrap_or(config.batch_workers);
        }

        config.validate()?;
        Ok(config)
    }

    /// The one config value whose absence/malformation is fatal at startup
    /// (§7, §10): the portfolio API base URL must be a parseable URL, since
    /// every batch run and every `BoostTopReturnStock`-eligible request
    /// depends on `PortfolioClient` being constructible against it.
    pub fn validate(&self) -> Result<(), EngineError> {
        reqwest::Url::parse(&self.portfolio_api.base_url).map_err(|e| {
            EngineError::ConfigMissing(format!(
                "portfolio_api.base_url {:?} is not a valid URL: {}",
                self.portfolio_api.base_url, e
            ))
        })?;
        Ok(())
    }

    /// Number of async workers to use for batch per-user parallelism.
    pub fn effective_batch_workers(&self) -> usize {
        if self.batch_workers == 0 {
            num_available_cores()
        } else {
            self.batch_workers
        }
    }
}

fn num_available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_enumerated_values() {
        let config = Config::default();
        assert_eq!(config.max_candidates_per_user, 500);
        assert_eq!(config.cf_user_history_limit, 100);
        assert_eq!(config.cf_min_co_occurrence, 2);
        assert_eq!(config.recommendation_count, 20);
        assert_eq!(config.cf_weight, 0.0);
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let err = Config::load("/nonexistent/path/config.toml");
        assert!(err.is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            bind_addr = "127.0.0.1:9000"

            [source_weights]
            global = 0.5
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.source_weights.global, 0.5);
        assert_eq!(config.source_weights.local, default_weight_local());
    }

    #[test]
    fn validate_rejects_unparseable_portfolio_url() {
        let mut config = Config::default();
        config.portfolio_api.base_url = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::ConfigMissing(_)));
    }

    #[test]
    fn validate_accepts_default_config() {
        assert!(Config::default().validate().is_ok());
    }
}
