//! Shared fixtures: a scripted PageSpeed API and a processor wired to a
//! temporary SQLite database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use psibatch::cache::SqliteCache;
use psibatch::config::QueueConfig;
use psibatch::processor::QueueProcessor;
use psibatch::psi::{CheckError, MetricsClient, PageSpeedApi, Strategy};
use psibatch::queue::{QueueStore, SqliteQueueStore};
use psibatch::rows::{RowId, RowStore, SqliteRowStore};
use psibatch::scheduler::{SqliteScheduler, TriggerScheduler, STEP_HANDLER};
use psibatch::storage::open_pool;
use serde_json::{json, Value};

/// A successful `runPagespeed` body with the given score (0.0 - 1.0).
pub fn lighthouse(score: f64) -> Value {
    json!({
        "lighthouseResult": {
            "categories": { "performance": { "score": score } },
            "audits": {
                "first-contentful-paint": { "displayValue": "1.2 s" },
                "speed-index": { "displayValue": "2.4 s" },
                "largest-contentful-paint": { "displayValue": "3.1 s" },
                "total-blocking-time": { "displayValue": "140 ms" },
                "cumulative-layout-shift": { "displayValue": "0.08" },
                "unused-javascript": {
                    "title": "Reduce unused JavaScript",
                    "details": { "type": "opportunity", "overallSavingsMs": 750.0 }
                }
            }
        }
    })
}

/// Scripted API. Unscripted calls succeed with a score of 0.9.
#[derive(Default)]
pub struct FakeApi {
    responses: Mutex<HashMap<(String, Strategy), Result<Value, CheckError>>>,
    calls: Mutex<Vec<(String, Strategy)>>,
    queue: OnceLock<Arc<dyn QueueStore>>,
    queue_at_call: Mutex<Vec<Option<Vec<RowId>>>>,
}

impl FakeApi {
    pub fn respond(&self, url: &str, strategy: Strategy, response: Result<Value, CheckError>) {
        self.responses
            .lock()
            .unwrap()
            .insert((url.to_string(), strategy), response);
    }

    pub fn calls(&self) -> Vec<(String, Strategy)> {
        self.calls.lock().unwrap().clone()
    }

    /// Record the persisted queue each time the API is called.
    pub fn observe_queue(&self, queue: Arc<dyn QueueStore>) {
        let _ = self.queue.set(queue);
    }

    pub fn queue_at_call(&self) -> Vec<Option<Vec<RowId>>> {
        self.queue_at_call.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PageSpeedApi for FakeApi {
    async fn fetch(&self, url: &str, strategy: Strategy) -> Result<Value, CheckError> {
        self.calls.lock().unwrap().push((url.to_string(), strategy));
        if let Some(queue) = self.queue.get() {
            self.queue_at_call.lock().unwrap().push(queue.load().unwrap());
        }
        self.responses
            .lock()
            .unwrap()
            .get(&(url.to_string(), strategy))
            .cloned()
            .unwrap_or_else(|| Ok(lighthouse(0.9)))
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub rows: Arc<SqliteRowStore>,
    pub queue: Arc<SqliteQueueStore>,
    pub scheduler: Arc<SqliteScheduler>,
    pub cache: Arc<SqliteCache>,
    pub api: Arc<FakeApi>,
    pub processor: QueueProcessor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(QueueConfig::default(), Duration::from_secs(3600), |rows| rows)
    }

    /// Build a harness; `wrap_rows` may decorate the row store seen by the
    /// processor.
    pub fn with(
        settings: QueueConfig,
        ttl: Duration,
        wrap_rows: impl FnOnce(Arc<dyn RowStore>) -> Arc<dyn RowStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("psibatch.db")).unwrap();

        let rows = Arc::new(SqliteRowStore::new(pool.clone()));
        let queue = Arc::new(SqliteQueueStore::new(pool.clone()));
        let scheduler = Arc::new(SqliteScheduler::new(pool.clone()));
        let cache = Arc::new(SqliteCache::new(pool));
        let api = Arc::new(FakeApi::default());

        let metrics = MetricsClient::new(api.clone(), cache.clone(), ttl);
        let store: Arc<dyn RowStore> = rows.clone();
        let processor = QueueProcessor::new(
            wrap_rows(store),
            queue.clone(),
            scheduler.clone(),
            metrics,
            settings,
        );

        Self {
            dir,
            rows,
            queue,
            scheduler,
            cache,
            api,
            processor,
        }
    }

    pub fn add(&self, urls: &[&str]) -> Vec<RowId> {
        urls.iter().map(|u| self.rows.add_url(u).unwrap()).collect()
    }

    pub fn status(&self, id: RowId) -> String {
        self.rows.get(id).unwrap().unwrap().status
    }

    pub fn step_triggers(&self) -> usize {
        self.scheduler.pending(STEP_HANDLER).unwrap().len()
    }

    pub fn queue_save(&self, pending: &[RowId]) {
        self.queue.save(pending).unwrap();
    }

    pub fn pending(&self) -> Option<Vec<RowId>> {
        self.queue.load().unwrap()
    }
}
