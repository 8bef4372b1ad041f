//! Queue orchestration: start, step, cancel, reset and clear.
//!
//! Exactly one row is in flight at a time. Between steps the entire
//! continuation is the persisted pending list plus a single outstanding
//! trigger for [`STEP_HANDLER`]; nothing is held in memory.

pub mod merge;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::psi::{MetricsClient, Strategy};
use crate::queue::QueueStore;
use crate::rows::{RowId, RowRecord, RowStatus, RowStore};
use crate::scheduler::{TriggerScheduler, STEP_HANDLER};

use self::merge::RowWrite;

/// Why `start` queued nothing. No state was changed.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("No URLs found in the row store.")]
    NoRows,

    #[error("No valid URLs found to process.")]
    NoValidUrls,

    #[error("No new URLs to process. All valid URLs are already marked as \"Complete\".")]
    AllComplete,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Conditions that abort a run instead of being recorded on a row.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("row store unavailable, run aborted: {0:#}")]
    StoreUnavailable(anyhow::Error),

    #[error("queue state error: {0:#}")]
    State(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub queued: usize,
}

/// What a single `step` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No active run.
    Idle,
    /// One row went through the API. `remaining == 0` means the run finished.
    Processed {
        row: RowId,
        status: RowStatus,
        skipped: Vec<RowId>,
        remaining: usize,
    },
    /// The queue emptied while skipping rows that needed no work.
    Drained { skipped: Vec<RowId> },
}

/// Counts reported by [`QueueProcessor::clear_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearReport {
    pub stopped: usize,
    pub cache_entries: usize,
    pub rows_cleared: usize,
}

/// Drives rows through the metrics client one at a time.
pub struct QueueProcessor {
    rows: Arc<dyn RowStore>,
    queue: Arc<dyn QueueStore>,
    scheduler: Arc<dyn TriggerScheduler>,
    metrics: MetricsClient,
    settings: QueueConfig,
}

impl QueueProcessor {
    pub fn new(
        rows: Arc<dyn RowStore>,
        queue: Arc<dyn QueueStore>,
        scheduler: Arc<dyn TriggerScheduler>,
        metrics: MetricsClient,
        settings: QueueConfig,
    ) -> Self {
        Self {
            rows,
            queue,
            scheduler,
            metrics,
            settings,
        }
    }

    /// Queue every checkable, not-yet-complete row and arm the first step.
    ///
    /// With rows present, any previous run is cleared before validation, even
    /// when nothing ends up queued. Row statuses are only touched once
    /// validation passes.
    pub fn start(&self) -> Result<StartOutcome, StartError> {
        if self.rows.row_count()? == 0 {
            return Err(StartError::NoRows);
        }

        // Clean up any previous run
        self.cancel()?;

        let rows = self.rows.rows()?;
        let selected: Vec<RowId> = rows
            .iter()
            .filter(|r| r.has_checkable_url() && !r.is_complete())
            .map(|r| r.id)
            .collect();

        if selected.is_empty() {
            return Err(if rows.iter().any(RowRecord::has_checkable_url) {
                StartError::AllComplete
            } else {
                StartError::NoValidUrls
            });
        }

        // One batch: selected rows become Queued, leftovers of an older run
        // that are not being re-queued become Stopped.
        let wanted: HashSet<RowId> = selected.iter().copied().collect();
        let updates: Vec<(RowId, RowStatus)> = rows
            .iter()
            .filter_map(|r| {
                let status = r.status();
                if wanted.contains(&r.id) {
                    (status != Some(RowStatus::Queued)).then_some((r.id, RowStatus::Queued))
                } else if status.is_some_and(|s| s.is_pending()) {
                    Some((r.id, RowStatus::Stopped))
                } else {
                    None
                }
            })
            .collect();
        self.rows.set_statuses(&updates)?;

        self.queue.save(&selected)?;
        self.scheduler
            .after(self.settings.start_delay(), STEP_HANDLER)?;

        info!(queued = selected.len(), "Queued URLs for processing");
        Ok(StartOutcome {
            queued: selected.len(),
        })
    }

    /// Advance the queue by one row. Invoked by each trigger firing.
    ///
    /// Rows that are already `Complete` are skipped without an API call and
    /// without waiting for another trigger.
    pub async fn step(&self) -> Result<StepOutcome, ProcessorError> {
        let mut skipped = Vec::new();

        loop {
            let mut pending = match self.queue.load()? {
                Some(pending) if !pending.is_empty() => pending,
                _ => {
                    self.cancel()?;
                    return Ok(if skipped.is_empty() {
                        info!("Queue empty, nothing to do");
                        StepOutcome::Idle
                    } else {
                        StepOutcome::Drained { skipped }
                    });
                }
            };

            // Persist the shorter list before any external call so a crash
            // mid-check neither repeats nor loses rows.
            let row_id = pending.remove(0);
            self.queue.save(&pending)?;

            let record = match self.rows.get(row_id) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(row = %row_id, "Queued row no longer exists, skipping");
                    skipped.push(row_id);
                    continue;
                }
                Err(e) => {
                    error!(row = %row_id, error = %e, "Row store unavailable, stopping process");
                    if let Err(cleanup) = self.cancel() {
                        error!(error = %cleanup, "Cleanup after store failure also failed");
                    }
                    return Err(ProcessorError::StoreUnavailable(e));
                }
            };

            if record.is_complete() {
                info!(row = %row_id, url = %record.url, "Skipping row, status is already Complete");
                skipped.push(row_id);
                continue;
            }

            let status = self.process_row(row_id, &record.url).await;
            let remaining = pending.len();

            if remaining > 0 {
                self.scheduler.cancel_all(STEP_HANDLER)?;
                let next = self
                    .scheduler
                    .after(self.settings.item_delay(), STEP_HANDLER)?;
                info!(row = %row_id, %status, remaining, next = %next.fire_at.to_rfc3339(), "Row processed");
            } else {
                info!(row = %row_id, %status, "Finished processing the last URL");
                self.cancel()?;
            }

            return Ok(StepOutcome::Processed {
                row: row_id,
                status,
                skipped,
                remaining,
            });
        }
    }

    /// Check one row and record the outcome on it. Never fails: anything
    /// that goes wrong ends up as `Script Error` on the row.
    async fn process_row(&self, row: RowId, url: &str) -> RowStatus {
        match self.check_and_record(row, url).await {
            Ok(status) => status,
            Err(e) => {
                error!(%row, %url, error = %e, "Processing failed");
                let write = merge::script_error(&format!("{:#}", e));
                if let Err(e) = self.rows.set_range(row, RowWrite::START, &write.values) {
                    error!(%row, error = %e, "Failed to record script error");
                }
                write.status
            }
        }
    }

    async fn check_and_record(&self, row: RowId, url: &str) -> anyhow::Result<RowStatus> {
        self.rows.set_status(row, RowStatus::Processing)?;
        self.rows.flush()?;

        info!(%row, %url, "Checking URL");
        let mobile = self.metrics.check(url, Strategy::Mobile).await;
        let desktop = self.metrics.check(url, Strategy::Desktop).await;

        let write = merge::merge(url, &mobile, &desktop, Utc::now());
        self.rows.set_range(row, RowWrite::START, &write.values)?;
        Ok(write.status)
    }

    /// Re-arm a run whose step trigger was lost, e.g. when a worker died
    /// after claiming the trigger but before the step finished. Returns
    /// whether a trigger was armed.
    pub fn resume(&self) -> anyhow::Result<bool> {
        let has_work = self
            .queue
            .load()?
            .is_some_and(|pending| !pending.is_empty());
        if !has_work || !self.scheduler.pending(STEP_HANDLER)?.is_empty() {
            return Ok(false);
        }

        let next = self
            .scheduler
            .after(self.settings.start_delay(), STEP_HANDLER)?;
        warn!(next = %next.fire_at.to_rfc3339(), "Queue had no step scheduled, re-armed");
        Ok(true)
    }

    /// Forget the active run: drop the pending list and every step trigger.
    /// Safe to call when idle.
    pub fn cancel(&self) -> anyhow::Result<usize> {
        self.queue.delete()?;
        let removed = self.scheduler.cancel_all(STEP_HANDLER)?;
        info!(triggers_removed = removed, "Cleanup complete");
        Ok(removed)
    }

    /// User-initiated stop: cancel, then mark every Queued or Processing row
    /// as Stopped in one write. Returns the number of rows stopped.
    pub fn reset(&self) -> anyhow::Result<usize> {
        self.cancel()?;

        let updates: Vec<(RowId, RowStatus)> = self
            .rows
            .rows()?
            .iter()
            .filter(|r| r.status().is_some_and(|s| s.is_pending()))
            .map(|r| (r.id, RowStatus::Stopped))
            .collect();
        self.rows.set_statuses(&updates)?;

        info!(stopped = updates.len(), "Process stopped");
        Ok(updates.len())
    }

    /// Stop any run, empty the result cache and blank every row's results.
    pub fn clear_all(&self) -> anyhow::Result<ClearReport> {
        let stopped = self.reset()?;
        let cache_entries = self.metrics.clear_cache()?;
        let rows_cleared = self.rows.clear_results()?;
        info!(cache_entries, rows_cleared, "Cache and results cleared");
        Ok(ClearReport {
            stopped,
            cache_entries,
            rows_cleared,
        })
    }
}
