use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::{TriggerScheduler, STEP_HANDLER};
use crate::processor::QueueProcessor;

/// Worker loop.
/// Re-arms an interrupted run on entry, then polls for due step triggers
/// and runs one step per firing. With `until_idle` the loop returns once no
/// step trigger is outstanding; otherwise it runs until Ctrl-C.
pub async fn run_worker(
    processor: &QueueProcessor,
    scheduler: &dyn TriggerScheduler,
    poll: Duration,
    until_idle: bool,
) -> Result<()> {
    info!(poll_ms = poll.as_millis() as u64, until_idle, "Worker started");

    // A previous worker may have claimed a trigger and died mid-step
    if let Err(e) = processor.resume() {
        error!("Failed to check for an interrupted run: {}", e);
    }

    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                // Queue state and the pending trigger stay in the database;
                // the next worker picks them up.
                info!("Shutdown requested, worker exiting");
                return Ok(());
            }
        }

        fire_due(processor, scheduler).await;

        if until_idle {
            match scheduler.pending(STEP_HANDLER) {
                Ok(pending) if pending.is_empty() => {
                    info!("No pending triggers, worker exiting");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => error!("Failed to list pending triggers: {}", e),
            }
        }
    }
}

/// Claim due step triggers and run the step once. Returns whether a step ran.
pub async fn fire_due(processor: &QueueProcessor, scheduler: &dyn TriggerScheduler) -> bool {
    let due = match scheduler.take_due(STEP_HANDLER, Utc::now()) {
        Ok(due) => due,
        Err(e) => {
            error!("Failed to check due triggers: {}", e);
            return false;
        }
    };

    if due.is_empty() {
        return false;
    }
    if due.len() > 1 {
        // Only one step trigger should ever exist; collapse extras into one step.
        warn!(count = due.len(), "Multiple step triggers were due");
    }

    match processor.step().await {
        Ok(outcome) => info!(?outcome, "Step finished"),
        Err(e) => error!("Step failed: {}", e),
    }
    true
}
