// src/ingest/mod.rs
pub mod extract;
pub mod fetcher;
pub mod orchestrator;
pub mod persist;
pub mod scheduler;
pub mod types;

use std::sync::Arc;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;

use crate::ingest::orchestrator::Orchestrator;
use crate::ingest::persist::{PersistReport, Persister};
use crate::ingest::scheduler::{OverlapPolicy, Scheduler};
use crate::ingest::types::{Item, PageFetcher, SourceJob};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("scrape_pages_total", "Listing pages fetched and extracted.");
        describe_counter!("scrape_items_total", "Items extracted from listing pages.");
        describe_counter!(
            "scrape_fetch_retries_total",
            "Page fetch retries after a rate-limit signal."
        );
        describe_counter!(
            "scrape_fetch_errors_total",
            "Page fetches that failed for good (exhausted or non-retryable)."
        );
        describe_histogram!("scrape_run_ms", "Duration of a multi-page scrape in milliseconds.");
        describe_counter!("persist_inserted_total", "Stories inserted into the store.");
        describe_counter!(
            "persist_existing_total",
            "Stories skipped because their key was already stored."
        );
        describe_counter!(
            "persist_batch_duplicates_total",
            "Stories collapsed as duplicates within one batch."
        );
        describe_counter!(
            "persist_incomplete_total",
            "Stories dropped for lacking url or author."
        );
        describe_counter!("persist_errors_total", "Store saves rolled back.");
        describe_counter!("scheduler_runs_total", "Job runs started by a scheduler.");
        describe_counter!(
            "scheduler_skipped_total",
            "Firings skipped because the previous run was still in flight."
        );
        describe_gauge!("ingest_last_run_ts", "Unix ts when a source job last finished.");
    });
}

/// Result of one job run for one source.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub items: Vec<Item>,
    pub report: Option<PersistReport>,
}

/// One job run: scrape every page of `job`, then persist what was found.
///
/// Never fails. A scrape error is logged and turns into an empty outcome so the
/// scheduler keeps firing; persistence errors are already contained by the persister.
pub async fn run_source<F: PageFetcher>(
    job: &SourceJob,
    orchestrator: &Orchestrator<F>,
    persister: &Persister,
) -> RunOutcome {
    ensure_metrics_described();
    tracing::info!(source = %job.name, started_at = %chrono::Utc::now().to_rfc3339(), "job started");

    let items = match orchestrator.run(job).await {
        Ok(items) => items,
        Err(e) => {
            tracing::error!(source = %job.name, error = %e, exhausted = e.is_exhausted(), "job produced nothing usable");
            return RunOutcome::default();
        }
    };

    let report = persister.persist(items.clone(), &job.name).await;
    gauge!("ingest_last_run_ts", "source" => job.name.clone()).set(chrono::Utc::now().timestamp() as f64);
    tracing::info!(
        source = %job.name,
        found = items.len(),
        inserted = report.inserted,
        "job finished"
    );

    RunOutcome {
        items,
        report: Some(report),
    }
}

/// Build a scheduler that runs `job` every `job.interval`, with log listeners attached.
pub fn schedule_source<F>(
    job: SourceJob,
    orchestrator: Arc<Orchestrator<F>>,
    persister: Persister,
    overlap: OverlapPolicy,
) -> Scheduler<RunOutcome>
where
    F: PageFetcher + 'static,
{
    let scheduler: Scheduler<RunOutcome> = Scheduler::new(job.name.clone(), overlap);

    let name = job.name.clone();
    scheduler.on_completed(move |done| {
        tracing::info!(
            source = %name,
            job_id = done.id,
            items = done.result.items.len(),
            "job completed"
        );
    });
    let name = job.name.clone();
    scheduler.on_error(move |failed| {
        tracing::error!(source = %name, job_id = failed.id, error = %failed.error, "job error");
    });

    let every = job.interval;
    let job = Arc::new(job);
    scheduler.schedule(
        move || {
            let job = Arc::clone(&job);
            let orchestrator = Arc::clone(&orchestrator);
            let persister = persister.clone();
            async move { Ok::<_, anyhow::Error>(run_source(&job, &orchestrator, &persister).await) }
        },
        every,
    );
    scheduler
}
