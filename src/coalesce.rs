//! Request coalescer (C7, §4.7).
//!
//! A small batching layer in front of the ranking engine: callers enqueue
//! `(cust_no, reply)` pairs; a dispatcher task wakes every
//! `COALESCE_INTERVAL`, drains the queue, and processes entries
//! concurrently bounded by a worker pool. Coalescing never merges two
//! customers' work — it only amortizes wake-ups and gives the dispatcher
//! one place to apply shared rate limits.

use crate::config::Config;
use crate::context::StockAffinitySource;
use crate::db::Database;
use crate::ranking::{RankingEngine, RankingResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};

struct QueueEntry {
    cust_no: String,
    reply: oneshot::Sender<RankingResult>,
}

/// Handle callers use to enqueue a request and await its result.
#[derive(Clone)]
pub struct Coalescer {
    sender: mpsc::UnboundedSender<QueueEntry>,
}

impl Coalescer {
    /// Spawns the dispatcher task and returns a cloneable handle.
    pub fn spawn(
        db: Arc<Database>,
        affinity: Arc<dyn StockAffinitySource>,
        config: Arc<Config>,
        engine: Arc<RankingEngine>,
        worker_pool_size: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(
            receiver,
            db,
            affinity,
            config,
            engine,
            worker_pool_size.max(1),
        ));
        Self { sender }
    }

    /// Enqueues `cust_no` and awaits its ranked result. Dropping the
    /// returned future before it resolves frees the reply handle without
    /// affecting any other enqueued entry (the sender side simply finds
    /// no receiver and the send is a no-op).
    pub async fn request(&self, cust_no: String) -> Option<RankingResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(QueueEntry { cust_no, reply: reply_tx }).is_err() {
            return None;
        }
        match reply_rx.await {
            Ok(result) => Some(result),
            Err(_) => {
                let err = crate::error::EngineError::Cancelled;
                tracing::debug!(error = %err, "request dropped before the dispatcher replied");
                None
            }
        }
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::UnboundedReceiver<QueueEntry>,
    db: Arc<Database>,
    affinity: Arc<dyn StockAffinitySource>,
    config: Arc<Config>,
    engine: Arc<RankingEngine>,
    worker_pool_size: usize,
) {
    let interval = std::time::Duration::from_secs(config.coalesce_interval_secs.max(1));
    let semaphore = Arc::new(Semaphore::new(worker_pool_size));
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let mut batch = Vec::new();
        while let Ok(entry) = receiver.try_recv() {
            batch.push(entry);
        }
        if batch.is_empty() {
            continue;
        }

        tracing::debug!(batch_size = batch.len(), "coalescer dispatching batch");
        for entry in batch {
            let db = db.clone();
            let affinity = affinity.clone();
            let config = config.clone();
            let engine = engine.clone();
            let permit = semaphore.clone().acquire_owned().await;
            tokio::spawn(async move {
                let _permit = permit;
                let result = engine.rank(&db, affinity.as_ref(), &config, &entry.cust_no).await;
                // Caller cancellation => no receiver => send fails silently,
                // which is the intended "free the reply handle" behavior.
                let _ = entry.reply.send(result);
            });
        }
    }
}

/// Anonymous requests bypass the coalescer entirely (§4.7): returns a
/// shuffled prefix of the fixed `global_data/anonymous_recs` list.
pub async fn anonymous_recommendations(db: &Database, count: usize) -> Vec<String> {
    use rand::seq::SliceRandom;

    let mut ids = match db.load_anonymous_recs().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(error = %e, "anonymous recs load failed; returning empty");
            return Vec::new();
        }
    };
    ids.shuffle(&mut rand::thread_rng());
    ids.truncate(count);
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnknownStockAffinitySource;
    use crate::models::CandidateRecord;

    #[tokio::test]
    async fn scenario_e_anonymous_returns_prefix_of_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()];
        db.save_anonymous_recs(&all).await.unwrap();

        let result = anonymous_recommendations(&db, 3).await;
        assert_eq!(result.len(), 3);
        let as_set: std::collections::HashSet<&String> = result.iter().collect();
        assert_eq!(as_set.len(), 3);
        for id in &result {
            assert!(all.contains(id));
        }
    }

    #[tokio::test]
    async fn coalescer_delivers_independent_results_per_customer() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        db.save_candidates(
            &[
                CandidateRecord::from_scored("u1", vec![("a".to_string(), 1.0)], 500, chrono::Utc::now()),
                CandidateRecord::from_scored("u2", vec![("b".to_string(), 1.0)], 500, chrono::Utc::now()),
            ],
            100,
        )
        .await;

        let mut config = Config::default();
        config.coalesce_interval_secs = 1;
        let config = Arc::new(config);
        let engine = Arc::new(RankingEngine::new(&config));
        let affinity: Arc<dyn StockAffinitySource> = Arc::new(UnknownStockAffinitySource);

        let coalescer = Coalescer::spawn(db.clone(), affinity, config, engine, 4);

        let (r1, r2) = tokio::join!(coalescer.request("u1".to_string()), coalescer.request("u2".to_string()));
        let r1 = r1.unwrap();
        let r2 = r2.unwrap();
        assert_eq!(r1.ranked.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(), vec!["a".to_string()]);
        assert_eq!(r2.ranked.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>(), vec!["b".to_string()]);
    }
}
