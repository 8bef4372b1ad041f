//! psibatch -- resumable PageSpeed Insights batch checker.
//!
//! Checks a long list of URLs against the PageSpeed Insights API one at a
//! time, keeping every bit of progress in SQLite so a run survives restarts.

pub mod cache;
pub mod config;
pub mod processor;
pub mod psi;
pub mod queue;
pub mod rows;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::cache::SqliteCache;
use crate::config::Config;
use crate::processor::QueueProcessor;
use crate::psi::{HttpPageSpeedApi, MetricsClient};
use crate::queue::SqliteQueueStore;
use crate::rows::SqliteRowStore;
use crate::scheduler::SqliteScheduler;

/// SQLite-backed wiring of every component.
pub struct App {
    pub rows: Arc<SqliteRowStore>,
    pub scheduler: Arc<SqliteScheduler>,
    pub cache: Arc<SqliteCache>,
    pub processor: QueueProcessor,
}

impl App {
    /// Open the database named in `config` and build the processor on top.
    pub fn open(config: &Config) -> Result<Self> {
        tracing::debug!(db_path = %config.storage.db_path.display(), "Opening database");
        let pool = storage::open_pool(&config.storage.db_path)?;

        let rows = Arc::new(SqliteRowStore::new(pool.clone()));
        let scheduler = Arc::new(SqliteScheduler::new(pool.clone()));
        let cache = Arc::new(SqliteCache::new(pool.clone()));
        let queue = Arc::new(SqliteQueueStore::new(pool));

        let api = Arc::new(HttpPageSpeedApi::new(&config.api)?);
        let metrics = MetricsClient::new(api, cache.clone(), config.cache.ttl());

        let processor = QueueProcessor::new(
            rows.clone(),
            queue,
            scheduler.clone(),
            metrics,
            config.queue.clone(),
        );

        Ok(Self {
            rows,
            scheduler,
            cache,
            processor,
        })
    }

    /// Run the worker loop until Ctrl-C, or until the queue is idle.
    pub async fn run_worker(&self, config: &Config, until_idle: bool) -> Result<()> {
        match self.cache.purge_expired() {
            Ok(purged) if purged > 0 => tracing::info!(purged, "Purged expired cache entries"),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to purge expired cache entries: {}", e),
        }

        scheduler::run_worker(
            &self.processor,
            self.scheduler.as_ref(),
            config.scheduler.poll_interval(),
            until_idle,
        )
        .await
    }
}
