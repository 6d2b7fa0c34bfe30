use crate::config::load_config;
use crate::fetch::FileFetcher;
use crate::pipeline::{Context, prepare_memory_store, run_pass};
use crate::retry::RetryPolicy;
use crate::store::MemoryStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub config_path: PathBuf,
    pub snapshot_path: Option<PathBuf>,
    /// Clock for both passes; defaults to the current time.
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessReport {
    pub first_run_jobs: usize,
    pub first_run_scraped: usize,
    pub first_run_inserted: usize,
    pub first_run_failed: usize,
    pub second_run_inserted: usize,
    pub second_run_failed: usize,
    pub failed_jobs: Vec<String>,
    pub total_rows: usize,
    pub idempotent: bool,
}

/// Runs two full passes over local pages into an in-memory store and
/// reports whether the second pass found anything new.
pub fn run_harness(options: &HarnessOptions) -> Result<HarnessReport> {
    if let Some(path) = &options.snapshot_path
        && path.exists()
    {
        std::fs::remove_file(path)?;
    }

    let loaded = load_config(&options.config_path)?;
    let store = MemoryStore::default();
    prepare_memory_store(&store, &loaded.config);
    let fetcher = FileFetcher::new(&loaded.path);

    let ctx = Context {
        config: &loaded,
        fetcher: &fetcher,
        store: &store,
        classifier: None,
        retry: RetryPolicy {
            backoff: std::time::Duration::ZERO,
            ..RetryPolicy::from(&loaded.config.retry)
        },
        now: options.now.unwrap_or_else(Utc::now),
    };

    let first = run_pass(&ctx, None);
    let second = run_pass(&ctx, None);

    if let Some(path) = &options.snapshot_path {
        store.save_snapshot(path)?;
    }

    let mut failed_jobs = first.failed_jobs.clone();
    failed_jobs.extend(second.failed_jobs.iter().cloned());
    let second_run_inserted = second.total_inserted();

    Ok(HarnessReport {
        first_run_jobs: first.jobs.len(),
        first_run_scraped: first.jobs.iter().map(|j| j.scraped).sum(),
        first_run_inserted: first.total_inserted(),
        first_run_failed: first.jobs.iter().map(|j| j.failed).sum(),
        second_run_inserted,
        second_run_failed: second.jobs.iter().map(|j| j.failed).sum(),
        failed_jobs,
        total_rows: store.total_rows(),
        idempotent: second_run_inserted == 0,
    })
}
