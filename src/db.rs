//! Data access layer (C2, §4.2).
//!
//! Four readers and one writer over a SQLite-backed document/index store.
//! SQLite stands in for the source's three stores (a document database for
//! users/content/candidates, a time-partitioned search index for
//! interaction logs and daily quotes, an HTTP API for portfolio data) —
//! §5's connection-pool language ("Mongo ~10, Oracle min/max, OpenSearch
//! per-node ~100") describes configuration knobs for stores this
//! implementation collapses into one embedded database; see DESIGN.md.
//!
//! A single writer connection guarded by a mutex, matching §5's "Shared
//! resources" note that each store owns its own concurrency discipline.
//! Reads share the same connection: SQLite serializes internally, and the
//! dataset sizes here never justify a separate read pool.

use crate::config::PortfolioApiConfig;
use crate::error::EngineError;
use crate::models::{CandidateRecord, ContentMeta, CustomerId, ItemId, PortfolioData, PortfolioHolding, StockReturn, UserProfile};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A daily quote row from the `screen-YYYYMMDD` index convention (§6).
#[derive(Debug, Clone)]
pub struct QuoteRow {
    pub code: String,
    pub country: String,
    pub one_day_return: Option<f64>,
    pub one_month_return: Option<f64>,
    pub market_cap: Option<f64>,
    pub quote_date: String,
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open curation database")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                cust_no TEXT PRIMARY KEY,
                concerns_json TEXT NOT NULL DEFAULT '[]',
                last_login_dt TEXT
            );

            CREATE TABLE IF NOT EXISTS contents (
                item_id TEXT PRIMARY KEY,
                label TEXT NOT NULL DEFAULT '',
                btopic TEXT NOT NULL DEFAULT '',
                stopic TEXT NOT NULL DEFAULT '',
                sector TEXT NOT NULL DEFAULT '',
                liked_users_json TEXT NOT NULL DEFAULT '[]',
                market_cap REAL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS curation_logs (
                cust_no TEXT NOT NULL,
                curation_id TEXT NOT NULL,
                log_date TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_curation_logs_cust_date
                ON curation_logs(cust_no, log_date);

            CREATE TABLE IF NOT EXISTS quotes (
                shrt_code TEXT NOT NULL,
                country TEXT NOT NULL,
                one_day_return REAL,
                one_month_return REAL,
                market_cap REAL,
                quote_date TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quotes_date ON quotes(quote_date);

            CREATE TABLE IF NOT EXISTS user_candidate (
                cust_no TEXT PRIMARY KEY,
                curation_list_json TEXT NOT NULL,
                create_dt TEXT NOT NULL,
                modi_dt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS global_data (
                id TEXT PRIMARY KEY,
                curation_ids_json TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// `LoadUsers` (§4.2). Streamed in cursor-sized pages internally; the
    /// dataset sizes this embedded store targets never require exposing
    /// the page boundary to callers, so the public surface returns the
    /// fully-drained `Vec`.
    pub async fn load_users(&self) -> Result<Vec<UserProfile>> {
        const PAGE_SIZE: i64 = 1000;
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        let mut offset = 0i64;
        loop {
            let mut stmt = conn.prepare(
                "SELECT cust_no, concerns_json, last_login_dt FROM users ORDER BY cust_no LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(params![PAGE_SIZE, offset])?;
            let mut page_count = 0;
            while let Some(row) = rows.next()? {
                let cust_no: String = row.get(0)?;
                let concerns_json: String = row.get(1)?;
                let last_login_raw: Option<String> = row.get(2)?;
                let concerns = serde_json::from_str(&concerns_json).unwrap_or_default();
                let last_login_dt = last_login_raw.and_then(|s| parse_timestamp(&s));
                out.push(UserProfile {
                    cust_no,
                    concerns,
                    last_login_dt,
                });
                page_count += 1;
            }
            if page_count < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(out)
    }

    /// `LoadContents` (§4.2), same paging discipline as `load_users`.
    pub async fn load_contents(&self) -> Result<Vec<ContentMeta>> {
        const PAGE_SIZE: i64 = 1000;
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        let mut offset = 0i64;
        loop {
            let mut stmt = conn.prepare(
                "SELECT item_id, label, btopic, stopic, sector, liked_users_json, market_cap, created_at
                 FROM contents ORDER BY item_id LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(params![PAGE_SIZE, offset])?;
            let mut page_count = 0;
            while let Some(row) = rows.next()? {
                let liked_users_json: String = row.get(5)?;
                let created_at_raw: String = row.get(7)?;
                out.push(ContentMeta {
                    item_id: row.get(0)?,
                    label: row.get(1)?,
                    btopic: row.get(2)?,
                    stopic: row.get(3)?,
                    sector: row.get(4)?,
                    liked_users: serde_json::from_str(&liked_users_json).unwrap_or_default(),
                    market_cap: row.get(6)?,
                    created_at: parse_timestamp(&created_at_raw).unwrap_or_else(Utc::now),
                });
                page_count += 1;
            }
            if page_count < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(out)
    }

    /// `LoadInteractions(days)` (§4.2): scans the last `days` time-partitioned
    /// logs and returns per-user histories, most recent first. Partial
    /// failures (a single day's scan erroring) are swallowed: the union of
    /// what succeeded is returned and the miss is logged, never raised.
    pub async fn load_interactions(&self, days: u32) -> Result<HashMap<CustomerId, Vec<ItemId>>> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let conn = self.conn.lock().await;
        let mut per_user: HashMap<CustomerId, Vec<(String, ItemId)>> = HashMap::new();

        let result: rusqlite::Result<()> = (|| {
            let mut stmt = conn.prepare(
                "SELECT cust_no, curation_id, ts FROM curation_logs WHERE ts >= ?1",
            )?;
            let mut rows = stmt.query(params![cutoff_str])?;
            while let Some(row) = rows.next()? {
                let cust_no: String = row.get(0)?;
                let curation_id: String = row.get(1)?;
                let ts: String = row.get(2)?;
                per_user.entry(cust_no).or_default().push((ts, curation_id));
            }
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(error = %e, "interaction log scan partially failed; returning partial union");
        }

        let mut out = HashMap::with_capacity(per_user.len());
        for (cust_no, mut entries) in per_user {
            entries.sort_by(|a, b| b.0.cmp(&a.0));
            out.insert(cust_no, entries.into_iter().map(|(_, id)| id).collect());
        }
        Ok(out)
    }

    /// `FetchLatestQuotes` (§4.2): newest-first, stops once `max_records`
    /// unique codes are collected, filters non-finite returns and
    /// `|return| > 50`.
    pub async fn fetch_latest_quotes(
        &self,
        days_back: u32,
        max_records: usize,
        allowed_countries: &[String],
    ) -> Result<Vec<QuoteRow>> {
        let cutoff = Utc::now() - chrono::Duration::days(days_back as i64);
        let cutoff_date = cutoff.format("%Y%m%d").to_string();

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT shrt_code, country, one_day_return, one_month_return, market_cap, quote_date
             FROM quotes WHERE quote_date >= ?1 ORDER BY quote_date DESC",
        )?;
        let mut rows = stmt.query(params![cutoff_date])?;

        let mut out = Vec::new();
        let mut seen_codes = std::collections::HashSet::new();
        while let Some(row) = rows.next()? {
            if seen_codes.len() >= max_records {
                break;
            }
            let country: String = row.get(1)?;
            if !allowed_countries.is_empty() && !allowed_countries.iter().any(|c| c == &country) {
                continue;
            }
            let one_day_return: Option<f64> = row.get(2)?;
            if let Some(r) = one_day_return {
                if !r.is_finite() || r.abs() > 50.0 {
                    continue;
                }
            }
            let code: String = row.get(0)?;
            if !seen_codes.insert(code.clone()) {
                continue;
            }
            out.push(QuoteRow {
                code,
                country,
                one_day_return,
                one_month_return: row.get(3)?,
                market_cap: row.get(4)?,
                quote_date: row.get(5)?,
            });
        }
        Ok(out)
    }

    /// `SaveCandidates` (§4.2): idempotent upsert by `cust_no`, batched,
    /// exponential backoff per batch; falls back to a timestamped local
    /// file on total failure and reports degraded success to the caller.
    pub async fn save_candidates(&self, records: &[CandidateRecord], batch_size: usize) -> SaveOutcome {
        if records.is_empty() {
            return SaveOutcome::Ok { saved: 0 };
        }

        let mut saved = 0usize;
        for batch in records.chunks(batch_size.max(1)) {
            match self.save_batch_with_retry(batch).await {
                Ok(()) => saved += batch.len(),
                Err(e) => {
                    tracing::error!(error = %e, batch_len = batch.len(), "candidate batch save exhausted retries; falling back to file");
                    if let Err(file_err) = Self::fallback_to_file(batch) {
                        tracing::error!(error = %file_err, "fallback file write also failed");
                    }
                    return SaveOutcome::Degraded {
                        saved,
                        fallback_records: records.len() - saved,
                    };
                }
            }
        }
        SaveOutcome::Ok { saved }
    }

    async fn save_batch_with_retry(&self, batch: &[CandidateRecord]) -> Result<(), EngineError> {
        const MAX_RETRIES: u32 = 3;
        let mut backoff_ms = 100u64;
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match self.save_batch_once(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(5_000);
                    }
                }
            }
        }
        Err(EngineError::IntegrityViolation(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    async fn save_batch_once(&self, batch: &[CandidateRecord]) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        for record in batch {
            let curation_list_json = serde_json::to_string(
                &record
                    .curation_list
                    .iter()
                    .map(|(id, score)| serde_json::json!({"curation_id": id, "score": score}))
                    .collect::<Vec<_>>(),
            )?;

            let existing_create_dt: Option<String> = conn
                .query_row(
                    "SELECT create_dt FROM user_candidate WHERE cust_no = ?1",
                    params![record.cust_no],
                    |row| row.get(0),
                )
                .optional()?;

            let create_dt = existing_create_dt.unwrap_or_else(|| record.create_dt.to_rfc3339());
            let modi_dt = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO user_candidate (cust_no, curation_list_json, create_dt, modi_dt)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cust_no) DO UPDATE SET
                    curation_list_json = excluded.curation_list_json,
                    modi_dt = excluded.modi_dt",
                params![record.cust_no, curation_list_json, create_dt, modi_dt],
            )?;
        }
        Ok(())
    }

    fn fallback_to_file(batch: &[CandidateRecord]) -> Result<()> {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let path = format!("candidates_fallback_{ts}.json");
        let json = serde_json::to_string_pretty(batch)?;
        std::fs::write(&path, json).context("write candidate fallback file")?;
        tracing::warn!(path = %path, count = batch.len(), "wrote degraded candidate batch to fallback file");
        Ok(())
    }

    /// Reads back a persisted `CandidateRecord` for the online path (§4.6
    /// step 1). Absent or malformed rows degrade to `None`, never an error.
    pub async fn get_candidate_record(&self, cust_no: &str) -> Result<Option<CandidateRecord>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT curation_list_json, create_dt, modi_dt FROM user_candidate WHERE cust_no = ?1",
                params![cust_no],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((curation_list_json, create_dt, modi_dt)) = row else {
            return Ok(None);
        };

        let raw: Vec<serde_json::Value> = match serde_json::from_str(&curation_list_json) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(cust_no, error = %e, "dropping malformed candidate record");
                return Ok(None);
            }
        };
        let curation_list: Vec<(ItemId, f64)> = raw
            .into_iter()
            .filter_map(|v| {
                let id = v.get("curation_id")?.as_str()?.to_string();
                let score = v.get("score")?.as_f64()?;
                Some((id, score))
            })
            .collect();

        Ok(Some(CandidateRecord {
            cust_no: cust_no.to_string(),
            curation_list,
            create_dt: parse_timestamp(&create_dt).unwrap_or_else(Utc::now),
            modi_dt: parse_timestamp(&modi_dt).unwrap_or_else(Utc::now),
        }))
    }

    /// Seed/update content metadata. Exposed for batch ingestion and tests;
    /// the source's content store is externally owned and read-only from
    /// the curation engine's perspective, so this is intentionally not
    /// part of the public reader contract.
    pub async fn upsert_content(&self, meta: &ContentMeta) -> Result<()> {
        let conn = self.conn.lock().await;
        let liked_users_json = serde_json::to_string(&meta.liked_users)?;
        conn.execute(
            "INSERT INTO contents (item_id, label, btopic, stopic, sector, liked_users_json, market_cap, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(item_id) DO UPDATE SET
                label = excluded.label, btopic = excluded.btopic, stopic = excluded.stopic,
                sector = excluded.sector, liked_users_json = excluded.liked_users_json,
                market_cap = excluded.market_cap",
            params![
                meta.item_id,
                meta.label,
                meta.btopic,
                meta.stopic,
                meta.sector,
                liked_users_json,
                meta.market_cap,
                meta.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_user(&self, user: &UserProfile) -> Result<()> {
        let conn = self.conn.lock().await;
        let concerns_json = serde_json::to_string(&user.concerns)?;
        conn.execute(
            "INSERT INTO users (cust_no, concerns_json, last_login_dt) VALUES (?1, ?2, ?3)
             ON CONFLICT(cust_no) DO UPDATE SET concerns_json = excluded.concerns_json, last_login_dt = excluded.last_login_dt",
            params![
                user.cust_no,
                concerns_json,
                user.last_login_dt.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn insert_curation_log(&self, cust_no: &str, curation_id: &str, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO curation_logs (cust_no, curation_id, log_date, ts) VALUES (?1, ?2, ?3, ?4)",
            params![cust_no, curation_id, ts.format("%Y%m%d").to_string(), ts.to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn insert_quote(&self, row: &QuoteRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO quotes (shrt_code, country, one_day_return, one_month_return, market_cap, quote_date) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.code, row.country, row.one_day_return, row.one_month_return, row.market_cap, row.quote_date],
        )?;
        Ok(())
    }

    /// `Ready` (§4.8): a trivial round-trip against the backing store, used
    /// by the readiness probe to distinguish "up" from "up but store
    /// unreachable".
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// `global_data/anonymous_recs` (§6). Empty when the document is absent.
    pub async fn load_anonymous_recs(&self) -> Result<Vec<ItemId>> {
        let conn = self.conn.lock().await;
        let row: Option<String> = conn
            .query_row(
                "SELECT curation_ids_json FROM global_data WHERE id = 'anonymous_recs'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    pub async fn save_anonymous_recs(&self, ids: &[ItemId]) -> Result<()> {
        let conn = self.conn.lock().await;
        let json = serde_json::to_string(ids)?;
        conn.execute(
            "INSERT INTO global_data (id, curation_ids_json) VALUES ('anonymous_recs', ?1)
             ON CONFLICT(id) DO UPDATE SET curation_ids_json = excluded.curation_ids_json",
            params![json],
        )?;
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| Utc.datetime_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
}

/// Outcome of `SaveCandidates`: `Ok` on a clean write, `Degraded` when some
/// batch fell back to a local file (§4.2, §7's `IntegrityViolation`).
#[derive(Debug, Clone, Copy)]
pub enum SaveOutcome {
    Ok { saved: usize },
    Degraded { saved: usize, fallback_records: usize },
}

/// Portfolio API client (§4.2 `FetchPortfolio`, §6). Missing/404/429/5xx
/// all degrade to an empty `PortfolioData`, never an error.
pub struct PortfolioClient {
    http: reqwest::Client,
    config: PortfolioApiConfig,
}

#[derive(Debug, Deserialize)]
struct PortfolioApiResponse {
    #[serde(default)]
    portfolio_info: Vec<PortfolioInfoEntry>,
    #[serde(default)]
    sector_weight: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct PortfolioInfoEntry {
    #[serde(default)]
    kor_name: String,
    #[serde(default)]
    gic_code: String,
    #[serde(default)]
    sector: String,
    #[serde(default)]
    label: String,
}

impl PortfolioClient {
    pub fn new(config: PortfolioApiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Bounded retry policy: up to `max_retries` retries on status in
    /// `{429,500,502,503,504}`, exponential backoff, per-attempt timeout;
    /// exhaustion returns empty, not an error.
    pub async fn fetch_portfolio(&self, cust_no: &str) -> PortfolioData {
        let mut backoff_ms = self.config.initial_backoff_ms;

        for attempt in 0..=self.config.max_retries {
            let response = self
                .http
                .post(&self.config.base_url)
                .json(&serde_json::json!({
                    "customer_no": cust_no,
                    "target_type": ["STOCK"],
                    "top_n": 50,
                }))
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return match resp.json::<PortfolioApiResponse>().await {
                        Ok(body) => PortfolioData {
                            holdings: body
                                .portfolio_info
                                .into_iter()
                                .map(|e| PortfolioHolding {
                                    label: e.label,
                                    sector: e.sector,
                                    gic_code: e.gic_code,
                                })
                                .collect(),
                            sector_weight: body.sector_weight,
                        },
                        Err(e) => {
                            tracing::warn!(cust_no, error = %e, "portfolio API returned unparseable body; degrading to empty");
                            PortfolioData::default()
                        }
                    };
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retryable = matches!(status, 429 | 500 | 502 | 503 | 504);
                    if !retryable || attempt == self.config.max_retries {
                        tracing::warn!(cust_no, status, "portfolio API non-retryable or retries exhausted; degrading to empty");
                        return PortfolioData::default();
                    }
                }
                Err(e) => {
                    if attempt == self.config.max_retries {
                        tracing::warn!(cust_no, error = %e, "portfolio API unreachable after retries; degrading to empty");
                        return PortfolioData::default();
                    }
                }
            }

            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
        }

        PortfolioData::default()
    }
}
