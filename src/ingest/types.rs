// src/ingest/types.rs
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ingest::fetcher::FetchError;

/// Author value used when a listing row carries no author link.
pub const UNKNOWN_AUTHOR: &str = "unknown";

/// One harvested listing entry. Never mutated once extracted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Item {
    pub title: String,
    pub url: Option<String>,
    pub author: String,
    pub points: u32,
    pub observed_at: DateTime<Utc>,
}

/// Dedup identity of a persisted item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub url: String,
    pub author: String,
}

impl Item {
    /// `None` when url or author is missing; such items are never stored.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        let url = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())?;
        let author = self.author.trim();
        if author.is_empty() || author == UNKNOWN_AUTHOR {
            return None;
        }
        Some(IdentityKey {
            url: url.to_string(),
            author: author.to_string(),
        })
    }
}

/// Describes one logical listing source and how often to harvest it.
#[derive(Debug, Clone)]
pub struct SourceJob {
    /// Human label, also used to tag logs and metrics ("Front Page", "New Stories").
    pub name: String,
    pub endpoint: String,
    pub pages: u32,
    /// Wait before the first page of a run.
    pub settle_delay: Duration,
    /// Wait between two consecutive pages (not after the last).
    pub page_delay: Duration,
    pub interval: Duration,
}

impl SourceJob {
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(6);

    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, pages: u32, interval: Duration) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            pages,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
            page_delay: Self::DEFAULT_PAGE_DELAY,
            interval,
        }
    }

    pub fn with_delays(mut self, settle: Duration, page: Duration) -> Self {
        self.settle_delay = settle;
        self.page_delay = page;
        self
    }

    /// Page 1 is the bare endpoint; later pages carry `?p=<n>`.
    pub fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            self.endpoint.clone()
        } else {
            format!("{}?p={}", self.endpoint, page)
        }
    }
}

/// Transport seam used by the orchestrator; the HTTP fetcher is the production impl.
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}
