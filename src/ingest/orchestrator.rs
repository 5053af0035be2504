// src/ingest/orchestrator.rs
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};

use crate::ingest::extract::extract_items;
use crate::ingest::fetcher::FetchError;
use crate::ingest::types::{Item, PageFetcher, SourceJob};

/// Drives one paced multi-page scrape of a source.
pub struct Orchestrator<F> {
    fetcher: F,
}

impl<F: PageFetcher> Orchestrator<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Fetch pages `1..=job.pages` strictly in sequence and concatenate their items.
    ///
    /// Fails on the first page whose fetch fails (retry budget exhausted or a
    /// non-retryable error); items from earlier pages are discarded with it.
    pub async fn run(&self, job: &SourceJob) -> Result<Vec<Item>, FetchError> {
        let t0 = Instant::now();
        tracing::info!(source = %job.name, pages = job.pages, "starting multi-page scrape");
        tokio::time::sleep(job.settle_delay).await;

        let mut all = Vec::new();
        for page in 1..=job.pages {
            let url = job.page_url(page);
            tracing::info!(source = %job.name, page, %url, "scraping page");

            let body = self.fetcher.fetch(&url).await.inspect_err(|e| {
                tracing::error!(source = %job.name, page, error = %e, "page fetch failed");
            })?;
            let items = extract_items(&body, Utc::now());

            counter!("scrape_pages_total", "source" => job.name.clone()).increment(1);
            counter!("scrape_items_total", "source" => job.name.clone()).increment(items.len() as u64);
            tracing::debug!(source = %job.name, page, found = items.len(), "page extracted");
            all.extend(items);

            if page < job.pages {
                tracing::debug!(source = %job.name, delay_ms = job.page_delay.as_millis() as u64, "waiting before next page");
                tokio::time::sleep(job.page_delay).await;
            }
        }

        histogram!("scrape_run_ms", "source" => job.name.clone()).record(t0.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(source = %job.name, pages = job.pages, total = all.len(), "scrape completed");
        Ok(all)
    }
}
