//! End-to-end behaviour of the queue processor against a scripted API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{Harness, FakeApi};
use psibatch::config::QueueConfig;
use psibatch::processor::{ProcessorError, StartError, StepOutcome};
use psibatch::psi::{CheckError, Strategy};
use psibatch::rows::{Column, RowId, RowRecord, RowStatus, RowStore};
use psibatch::scheduler::{run_worker, TriggerScheduler, STEP_HANDLER};

fn mobile_urls(api: &FakeApi) -> Vec<String> {
    api.calls()
        .into_iter()
        .filter(|(_, s)| *s == Strategy::Mobile)
        .map(|(u, _)| u)
        .collect()
}

#[tokio::test]
async fn test_three_rows_run_to_completion() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example/", "https://b.example/", "https://c.example/"]);

    let outcome = h.processor.start().unwrap();
    assert_eq!(outcome.queued, 3);
    for id in &ids {
        assert_eq!(h.status(*id), "Queued");
    }
    assert_eq!(h.pending(), Some(ids.clone()));
    assert_eq!(h.step_triggers(), 1);

    for (i, id) in ids.iter().enumerate() {
        let outcome = h.processor.step().await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Processed {
                row: *id,
                status: RowStatus::Complete,
                skipped: vec![],
                remaining: 2 - i,
            }
        );
        assert!(h.step_triggers() <= 1);
    }

    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);

    for id in &ids {
        let row = h.rows.get(*id).unwrap().unwrap();
        assert_eq!(row.status, "Complete");
        assert!(row.last_checked.ends_with(" GMT"));
        assert_eq!(row.mobile, ["90", "1.2 s", "2.4 s", "3.1 s", "140 ms", "0.08"]);
        assert_eq!(row.desktop[0], "90");
        assert_eq!(
            row.mobile_issues,
            "1. Reduce unused JavaScript (Est. Savings: 750 ms)"
        );
        assert_eq!(row.desktop_issues, row.mobile_issues);
        assert!(row
            .report_link
            .starts_with("https://pagespeed.web.dev/report?url=https%3A%2F%2F"));
    }

    // FIFO, and mobile before desktop for each row
    assert_eq!(
        mobile_urls(&h.api),
        vec!["https://a.example/", "https://b.example/", "https://c.example/"]
    );
    let calls = h.api.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0].1, Strategy::Mobile);
    assert_eq!(calls[1].1, Strategy::Desktop);
}

#[tokio::test]
async fn test_invalid_urls_are_never_queued() {
    let h = Harness::new();
    let ids = h.add(&["", "ftp://files.example", "example.com", "https://ok.example"]);

    let outcome = h.processor.start().unwrap();
    assert_eq!(outcome.queued, 1);
    assert_eq!(h.pending(), Some(vec![ids[3]]));
    for id in &ids[..3] {
        assert_eq!(h.status(*id), "");
    }
}

#[tokio::test]
async fn test_complete_rows_are_not_requeued() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example", "https://c.example"]);
    h.rows.set_status(ids[1], RowStatus::Complete).unwrap();
    h.rows.set_status(ids[2], RowStatus::Error).unwrap();

    let outcome = h.processor.start().unwrap();
    assert_eq!(outcome.queued, 2);
    assert_eq!(h.pending(), Some(vec![ids[0], ids[2]]));
    assert_eq!(h.status(ids[1]), "Complete");
    assert_eq!(h.status(ids[2]), "Queued");
}

#[tokio::test]
async fn test_start_when_everything_is_complete() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);
    for id in &ids {
        h.rows.set_status(*id, RowStatus::Complete).unwrap();
    }

    let err = h.processor.start().unwrap_err();
    assert!(matches!(err, StartError::AllComplete));
    assert!(err.to_string().contains("already marked as \"Complete\""));
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
}

#[tokio::test]
async fn test_start_distinguishes_empty_and_invalid() {
    let h = Harness::new();
    assert!(matches!(h.processor.start(), Err(StartError::NoRows)));

    h.add(&["not a url", ""]);
    let err = h.processor.start().unwrap_err();
    assert!(matches!(err, StartError::NoValidUrls));
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
}

#[tokio::test]
async fn test_restart_replaces_previous_run() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);

    h.processor.start().unwrap();
    h.processor.start().unwrap();

    assert_eq!(h.step_triggers(), 1);
    assert_eq!(h.pending(), Some(ids));
}

#[tokio::test]
async fn test_start_with_nothing_to_do_clears_previous_run() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);
    h.processor.start().unwrap();

    // Rows finished elsewhere while the run was still armed
    for id in &ids {
        h.rows.set_status(*id, RowStatus::Complete).unwrap();
    }

    let err = h.processor.start().unwrap_err();
    assert!(matches!(err, StartError::AllComplete));
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
    for id in &ids {
        assert_eq!(h.status(*id), "Complete");
    }
}

#[tokio::test]
async fn test_step_persists_queue_before_calling_api() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example", "https://c.example"]);
    h.api.observe_queue(h.queue.clone());

    h.processor.start().unwrap();
    h.processor.step().await.unwrap();

    let remaining = Some(vec![ids[1], ids[2]]);
    assert_eq!(h.api.queue_at_call(), vec![remaining.clone(), remaining]);
}

#[tokio::test]
async fn test_complete_rows_are_skipped_without_api_calls() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example", "https://c.example"]);
    h.processor.start().unwrap();

    // Completed out-of-band after being queued
    h.rows.set_status(ids[0], RowStatus::Complete).unwrap();
    h.rows.set_status(ids[1], RowStatus::Complete).unwrap();

    let outcome = h.processor.step().await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Processed {
            row: ids[2],
            status: RowStatus::Complete,
            skipped: vec![ids[0], ids[1]],
            remaining: 0,
        }
    );
    assert_eq!(mobile_urls(&h.api), vec!["https://c.example"]);
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
}

#[tokio::test]
async fn test_queue_of_only_complete_rows_drains() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);
    h.processor.start().unwrap();
    for id in &ids {
        h.rows.set_status(*id, RowStatus::Complete).unwrap();
    }

    let outcome = h.processor.step().await.unwrap();
    assert_eq!(outcome, StepOutcome::Drained { skipped: ids });
    assert!(h.api.calls().is_empty());
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
}

#[tokio::test]
async fn test_desktop_failure_marks_row_error() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);
    h.api.respond(
        "https://a.example",
        Strategy::Desktop,
        Err(CheckError::Transport("timeout".into())),
    );

    h.processor.start().unwrap();
    let outcome = h.processor.step().await.unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Processed { status: RowStatus::Error, remaining: 1, .. }
    ));

    let row = h.rows.get(ids[0]).unwrap().unwrap();
    assert_eq!(row.status, "Error");
    assert!(row.mobile.iter().chain(row.desktop.iter()).all(|v| v == "N/A"));
    assert_eq!(row.mobile_issues, "Mobile: OK");
    assert_eq!(row.desktop_issues, "Desktop: timeout");
    assert_eq!(row.report_link, "N/A");

    // The failure is row-scoped: the run goes on
    assert_eq!(h.step_triggers(), 1);
    assert_eq!(h.pending(), Some(vec![ids[1]]));
}

#[tokio::test]
async fn test_reset_mid_run_stops_pending_rows() {
    let h = Harness::new();
    let ids = h.add(&[
        "https://a.example",
        "https://b.example",
        "https://c.example",
        "https://d.example",
    ]);
    h.processor.start().unwrap();
    h.processor.step().await.unwrap();
    // A step was interrupted while checking the second row
    h.rows.set_status(ids[1], RowStatus::Processing).unwrap();

    let stopped = h.processor.reset().unwrap();
    assert_eq!(stopped, 3);
    assert_eq!(h.status(ids[0]), "Complete");
    for id in &ids[1..] {
        assert_eq!(h.status(*id), "Stopped");
    }
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);

    // A stale firing after reset finds nothing to do
    let calls_before = h.api.calls().len();
    assert_eq!(h.processor.step().await.unwrap(), StepOutcome::Idle);
    assert_eq!(h.api.calls().len(), calls_before);

    // Reset is idempotent
    assert_eq!(h.processor.reset().unwrap(), 0);
}

#[tokio::test]
async fn test_clear_all_blanks_results_and_cache() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example"]);
    h.processor.start().unwrap();
    h.processor.step().await.unwrap();
    assert_eq!(h.status(ids[0]), "Complete");

    let report = h.processor.clear_all().unwrap();
    assert_eq!(report.cache_entries, 2);
    assert_eq!(report.rows_cleared, 1);

    let row = h.rows.get(ids[0]).unwrap().unwrap();
    assert_eq!(row.url, "https://a.example");
    assert!(row.fields()[1..].iter().all(|v| v.is_empty()));

    // Cache is gone, so the next run hits the API again
    h.processor.start().unwrap();
    h.processor.step().await.unwrap();
    assert_eq!(h.api.calls().len(), 4);
}

#[tokio::test]
async fn test_cached_results_skip_the_api() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example"]);
    h.processor.start().unwrap();
    h.processor.step().await.unwrap();
    let first = h.rows.get(ids[0]).unwrap().unwrap();

    // Re-run the same URL within the cache lifetime
    h.rows.set_status(ids[0], RowStatus::Stopped).unwrap();
    h.processor.start().unwrap();
    h.processor.step().await.unwrap();
    let second = h.rows.get(ids[0]).unwrap().unwrap();

    assert_eq!(h.api.calls().len(), 2);
    assert_eq!(first.mobile, second.mobile);
    assert_eq!(first.desktop_issues, second.desktop_issues);
}

/// Row store wrapper that fails on demand.
struct FlakyRows {
    inner: Arc<dyn RowStore>,
    fail_result_write: bool,
    fail_reads: bool,
}

impl RowStore for FlakyRows {
    fn row_count(&self) -> Result<usize> {
        self.inner.row_count()
    }

    fn rows(&self) -> Result<Vec<RowRecord>> {
        self.inner.rows()
    }

    fn get(&self, id: RowId) -> Result<Option<RowRecord>> {
        if self.fail_reads {
            anyhow::bail!("no such table: rows");
        }
        self.inner.get(id)
    }

    fn set_status(&self, id: RowId, status: RowStatus) -> Result<()> {
        self.inner.set_status(id, status)
    }

    fn set_statuses(&self, updates: &[(RowId, RowStatus)]) -> Result<()> {
        self.inner.set_statuses(updates)
    }

    fn set_range(&self, id: RowId, start: Column, values: &[String]) -> Result<()> {
        if self.fail_result_write && values.len() > 2 {
            anyhow::bail!("write quota exceeded");
        }
        self.inner.set_range(id, start, values)
    }

    fn add_url(&self, url: &str) -> Result<RowId> {
        self.inner.add_url(url)
    }

    fn clear_results(&self) -> Result<usize> {
        self.inner.clear_results()
    }
}

#[tokio::test]
async fn test_processing_fault_becomes_script_error() {
    let h = Harness::with(QueueConfig::default(), Duration::from_secs(3600), |inner| {
        Arc::new(FlakyRows {
            inner,
            fail_result_write: true,
            fail_reads: false,
        })
    });
    let ids = h.add(&["https://a.example", "https://b.example"]);

    h.processor.start().unwrap();
    let outcome = h.processor.step().await.unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Processed { status: RowStatus::ScriptError, remaining: 1, .. }
    ));

    let row = h.rows.get(ids[0]).unwrap().unwrap();
    assert_eq!(row.status, "Script Error");
    assert_eq!(row.last_checked, "write quota exceeded");
    assert_eq!(h.step_triggers(), 1);
    assert_eq!(h.pending(), Some(vec![ids[1]]));
}

#[tokio::test]
async fn test_missing_store_aborts_run_and_cleans_up() {
    let h = Harness::with(QueueConfig::default(), Duration::from_secs(3600), |inner| {
        Arc::new(FlakyRows {
            inner,
            fail_result_write: false,
            fail_reads: true,
        })
    });
    h.add(&["https://a.example", "https://b.example"]);

    h.processor.start().unwrap();
    let err = h.processor.step().await.unwrap_err();
    assert!(matches!(err, ProcessorError::StoreUnavailable(_)));
    assert!(h.api.calls().is_empty());
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
}

#[tokio::test]
async fn test_worker_drains_queue_until_idle() {
    let settings = QueueConfig {
        start_delay_ms: 0,
        item_delay_sec: 0,
    };
    let h = Harness::with(settings, Duration::from_secs(3600), |rows| rows);
    let ids = h.add(&["https://a.example", "https://b.example", "https://c.example"]);
    h.processor.start().unwrap();

    tokio::time::timeout(
        Duration::from_secs(10),
        run_worker(
            &h.processor,
            h.scheduler.as_ref(),
            Duration::from_millis(10),
            true,
        ),
    )
    .await
    .expect("worker should finish")
    .unwrap();

    for id in &ids {
        assert_eq!(h.status(*id), "Complete");
    }
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
    assert_eq!(h.api.calls().len(), 6);
}

#[tokio::test]
async fn test_worker_resumes_run_after_crash_mid_step() {
    let settings = QueueConfig {
        start_delay_ms: 0,
        item_delay_sec: 0,
    };
    let h = Harness::with(settings, Duration::from_secs(3600), |rows| rows);
    let ids = h.add(&["https://a.example", "https://b.example", "https://c.example"]);
    h.processor.start().unwrap();

    // A worker claims the trigger, pops the first row, then dies
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    assert_eq!(h.scheduler.take_due(STEP_HANDLER, later).unwrap().len(), 1);
    h.queue_save(&ids[1..]);
    assert_eq!(h.step_triggers(), 0);

    tokio::time::timeout(
        Duration::from_secs(10),
        run_worker(
            &h.processor,
            h.scheduler.as_ref(),
            Duration::from_millis(10),
            true,
        ),
    )
    .await
    .expect("worker should finish")
    .unwrap();

    assert_eq!(h.status(ids[0]), "Queued");
    assert_eq!(h.status(ids[1]), "Complete");
    assert_eq!(h.status(ids[2]), "Complete");
    assert_eq!(h.pending(), None);
    assert_eq!(h.step_triggers(), 0);
    assert_eq!(
        mobile_urls(&h.api),
        vec!["https://b.example", "https://c.example"]
    );
}

#[tokio::test]
async fn test_resume_only_arms_a_stalled_run() {
    let h = Harness::new();
    let ids = h.add(&["https://a.example", "https://b.example"]);

    // Idle: nothing to resume
    assert!(!h.processor.resume().unwrap());
    assert_eq!(h.step_triggers(), 0);

    // Healthy run: trigger already armed
    h.processor.start().unwrap();
    assert!(!h.processor.resume().unwrap());
    assert_eq!(h.step_triggers(), 1);

    // Stalled run: queue left behind without a trigger
    h.scheduler.cancel_all(STEP_HANDLER).unwrap();
    assert!(h.processor.resume().unwrap());
    assert_eq!(h.step_triggers(), 1);
    assert_eq!(h.pending(), Some(ids));
}
