mod scraper;

use std::io::BufRead;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use weir_core::{AppError, Event, Runner, RunnerConfig, TracingWorkerReporter};

use crate::scraper::{Entry, LineScraper};

#[derive(Parser)]
#[command(name = "weir", version, about = "Stream keys through a bounded worker pool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse name=value files concurrently and print one JSON line per file
    Scan {
        /// Files to scan (reads one path per line from stdin if omitted)
        paths: Vec<String>,

        /// Number of workers (defaults to WEIR_WORKERS or parallelism - 1)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Grace period per slow subscriber, in milliseconds
        #[arg(long, env = "WEIR_PUBLISH_GRACE_MS")]
        grace_ms: Option<u64>,

        /// Print only the first entry of each file
        #[arg(long, default_value_t = false)]
        first_only: bool,

        /// Give up on a file after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

#[derive(Serialize)]
struct FirstEntry<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weir_core=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            paths,
            workers,
            grace_ms,
            first_only,
            timeout_ms,
        } => {
            let mut config = RunnerConfig::from_env().context("Invalid runner configuration")?;
            if let Some(workers) = workers {
                config = config.with_worker_count(workers);
            }
            if let Some(ms) = grace_ms {
                config = config.with_publish_grace(Duration::from_millis(ms));
            }
            let paths = if paths.is_empty() {
                read_stdin_paths()?
            } else {
                paths
            };
            cmd_scan(paths, config, first_only, Duration::from_millis(timeout_ms)).await?;
        }
    }

    Ok(())
}

fn read_stdin_paths() -> Result<Vec<String>> {
    let stdin = std::io::stdin();
    let mut paths = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read paths from stdin")?;
        let line = line.trim();
        if !line.is_empty() {
            paths.push(line.to_string());
        }
    }
    Ok(paths)
}

async fn cmd_scan(
    paths: Vec<String>,
    config: RunnerConfig,
    first_only: bool,
    timeout: Duration,
) -> Result<()> {
    let runner = Runner::with_reporter(LineScraper, config, TracingWorkerReporter)
        .map_err(|e| anyhow::anyhow!(e))?;
    let mut pending: Vec<JoinHandle<String>> = Vec::with_capacity(paths.len());
    tracing::info!(files = paths.len(), first_only, "Scanning");

    for path in paths {
        // The waiter is bound to this attempt, so repeated paths each get their own line.
        let waiter = runner
            .submit(path.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let task = if first_only {
            tokio::spawn(async move {
                let result = waiter.recv_timeout(timeout).await;
                render_first(&path, result)
            })
        } else {
            tokio::spawn(async move {
                let result = tokio::time::timeout(timeout, waiter.recv_event())
                    .await
                    .unwrap_or(Err(AppError::WaitTimeout(timeout)));
                render_event(&path, result)
            })
        };
        pending.push(task);
    }

    runner.shutdown().await;

    for task in pending {
        let line = task.await.context("Output task failed")?;
        println!("{line}");
    }

    Ok(())
}

fn render_first(key: &str, result: Result<Entry, AppError>) -> String {
    let (entry, error) = match result {
        Ok(entry) => (Some(entry), None),
        Err(e) => (None, Some(e.to_string())),
    };
    serde_json::to_string(&FirstEntry { key, entry, error })
        .unwrap_or_else(|e| format!("{{\"key\":{key:?},\"error\":\"{e}\"}}"))
}

fn render_event(key: &str, result: Result<Event<Entry>, AppError>) -> String {
    match result {
        Ok(event) => serde_json::to_string(&event)
            .unwrap_or_else(|e| format!("{{\"key\":{key:?},\"error\":\"{e}\"}}")),
        Err(e) => render_first(key, Err(e)),
    }
}
