use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use psibatch::config::{Config, LoggingConfig};
use psibatch::processor::{StartError, StepOutcome};
use psibatch::rows::{is_checkable_url, RowStore};
use psibatch::scheduler::{TriggerScheduler, STEP_HANDLER};
use psibatch::App;

#[derive(Parser)]
#[command(
    name = "psibatch",
    about = "Resumable PageSpeed Insights batch checker",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $PSIBATCH_CONFIG, then ./psibatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add URLs as new rows
    Add {
        /// URLs to add
        urls: Vec<String>,

        /// Read URLs from a file, one per line ('#' starts a comment)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Queue every URL that is not yet Complete and arm the first check
    Start,

    /// Stop the current run; Queued and Processing rows become Stopped
    Stop,

    /// Stop any run, clear cached results and blank all result columns
    Clear,

    /// Show rows and queue progress
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run one queue step right now
    Step,

    /// Run the worker that fires scheduled steps
    Run {
        /// Exit once no step is scheduled
        #[arg(long)]
        until_idle: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let app = App::open(&config)?;

    match cli.command {
        Commands::Add { urls, file } => {
            let mut all = urls;
            if let Some(path) = file {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                all.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(str::to_string),
                );
            }
            if all.is_empty() {
                anyhow::bail!("No URLs given. Pass URLs as arguments or use --file.");
            }

            for url in &all {
                let id = app.rows.add_url(url)?;
                if !is_checkable_url(url) {
                    println!("Row {}: '{}' added, but it will be skipped (not http/https).", id, url);
                }
            }
            println!("Added {} row(s).", all.len());
        }
        Commands::Start => match app.processor.start() {
            Ok(outcome) => {
                println!(
                    "Queued {} URLs for processing. The first check will begin shortly.",
                    outcome.queued
                );
                println!(
                    "One URL is checked every {}s while `psibatch run` is active.",
                    config.queue.item_delay_sec
                );
            }
            Err(StartError::Store(e)) => return Err(e),
            Err(e) => println!("{}", e),
        },
        Commands::Stop => {
            let stopped = app.processor.reset()?;
            println!(
                "Process stopped. All pending checks have been cancelled ({} row(s) marked Stopped).",
                stopped
            );
        }
        Commands::Clear => {
            let report = app.processor.clear_all()?;
            println!(
                "Cache and results have been cleared ({} cached result(s), {} row(s)).",
                report.cache_entries, report.rows_cleared
            );
        }
        Commands::Status { json } => {
            let rows = app.rows.rows()?;
            let pending = app.scheduler.pending(STEP_HANDLER)?;

            if json {
                let out = serde_json::json!({
                    "rows": rows,
                    "next_step": pending.first().map(|t| t.fire_at.to_rfc3339()),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if rows.is_empty() {
                println!("No rows found. Add URLs with `psibatch add <URL>...`.");
            } else {
                println!("{:<5} | {:<50} | {:<13} | {:<6} | {:<6} | Last Checked", "Row", "URL", "Status", "Mob", "Desk");
                println!("{:-<5}-|-{:-<50}-|-{:-<13}-|-{:-<6}-|-{:-<6}-|-{:-<29}", "", "", "", "", "", "");
                for row in &rows {
                    println!(
                        "{:<5} | {:<50} | {:<13} | {:<6} | {:<6} | {}",
                        row.id, row.url, row.status, row.mobile[0], row.desktop[0], row.last_checked
                    );
                }
                match pending.first() {
                    Some(t) => println!("\nNext step scheduled at {}", t.fire_at.to_rfc3339()),
                    None => println!("\nNo run active."),
                }
            }
        }
        Commands::Step => match app.processor.step().await? {
            StepOutcome::Idle => println!("Queue is empty. Nothing to do."),
            StepOutcome::Processed {
                row,
                status,
                skipped,
                remaining,
            } => {
                if !skipped.is_empty() {
                    println!("Skipped {} row(s) already Complete.", skipped.len());
                }
                println!("Row {}: {} ({} remaining)", row, status, remaining);
            }
            StepOutcome::Drained { skipped } => {
                println!("Skipped {} row(s) already Complete. Queue finished.", skipped.len());
            }
        },
        Commands::Run { until_idle } => {
            tracing::info!(db_path = %config.storage.db_path.display(), "Starting psibatch worker");
            app.run_worker(&config, until_idle).await?;
        }
    }

    Ok(())
}
