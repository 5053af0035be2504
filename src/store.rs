// src/store.rs
//! SQLite-backed story store: pool, schema bootstrap, and the read queries
//! shared by the HTTP facade and the live subscription counts.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stories (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    url        TEXT,
    author     TEXT NOT NULL,
    points     INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stories_created_at ON stories(created_at);
CREATE INDEX IF NOT EXISTS idx_stories_identity ON stories(url, author);
";

pub const MAX_PAGE_LIMIT: i64 = 500;
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// A persisted story row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoryRecord {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub author: String,
    pub points: i64,
    pub created_at: DateTime<Utc>,
}

/// Ordering of a filtered listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryOrder {
    /// Newest first.
    #[default]
    Latest,
    /// Highest points first.
    Top,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryFilter {
    #[serde(rename = "type", default)]
    pub order: StoryOrder,
    pub author: Option<String>,
    pub title: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl StoryFilter {
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryPage {
    pub count: usize,
    pub total: i64,
    pub page: i64,
    pub total_pages: i64,
    pub stories: Vec<StoryRecord>,
}

/// Handle to the durable store. Cheap to clone (wraps the pool).
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` with a pool of `max_connections`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing database url {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database. Single connection that never expires, so the
    /// data lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("creating stories schema")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn total(&self) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stories")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Records created at or after `since`.
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stories WHERE created_at >= ?")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Records created in `[from, to)`.
    pub async fn count_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stories WHERE created_at >= ? AND created_at < ?",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Records created after `since`, newest first.
    pub async fn created_since(&self, since: DateTime<Utc>) -> Result<Vec<StoryRecord>> {
        let rows = sqlx::query_as::<_, StoryRecord>(
            "SELECT id, title, url, author, points, created_at FROM stories
             WHERE created_at >= ?
             ORDER BY created_at DESC, id DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Filtered, ordered, paginated listing plus the unpaginated total.
    pub async fn query(&self, filter: &StoryFilter) -> Result<StoryPage> {
        let limit = filter.effective_limit();
        let offset = filter.effective_offset();

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, title, url, author, points, created_at FROM stories",
        );
        push_conditions(&mut qb, filter);
        qb.push(match filter.order {
            StoryOrder::Top => " ORDER BY points DESC, id DESC",
            StoryOrder::Latest => " ORDER BY created_at DESC, id DESC",
        });
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);
        let stories = qb
            .build_query_as::<StoryRecord>()
            .fetch_all(&self.pool)
            .await?;

        let mut cq = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM stories");
        push_conditions(&mut cq, filter);
        let total = cq.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        Ok(StoryPage {
            count: stories.len(),
            total,
            page: offset / limit + 1,
            total_pages: (total + limit - 1) / limit,
            stories,
        })
    }
}

fn push_conditions(qb: &mut QueryBuilder<'_, Sqlite>, filter: &StoryFilter) {
    let mut joiner = " WHERE ";
    if let Some(author) = filter.author.as_deref().filter(|a| !a.is_empty()) {
        qb.push(joiner).push("author = ").push_bind(author.to_string());
        joiner = " AND ";
    }
    if let Some(title) = filter.title.as_deref().filter(|t| !t.is_empty()) {
        qb.push(joiner)
            .push("title LIKE ")
            .push_bind(format!("%{}%", escape_like(title)))
            .push(" ESCAPE '\\'");
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn insert(store: &Store, title: &str, author: &str, points: i64, at: DateTime<Utc>) {
        sqlx::query("INSERT INTO stories (title, url, author, points, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(title)
            .bind(format!("https://{title}.test"))
            .bind(author)
            .bind(points)
            .bind(at)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn counts_respect_window_bounds() {
        let store = Store::in_memory().await.unwrap();
        let t0 = Utc::now() - ChronoDuration::minutes(10);
        insert(&store, "old", "a", 1, t0).await;
        insert(&store, "mid", "a", 1, t0 + ChronoDuration::minutes(5)).await;
        insert(&store, "new", "a", 1, t0 + ChronoDuration::minutes(9)).await;

        assert_eq!(store.total().await.unwrap(), 3);
        assert_eq!(store.count_since(t0 + ChronoDuration::minutes(5)).await.unwrap(), 2);
        assert_eq!(
            store
                .count_between(t0, t0 + ChronoDuration::minutes(5))
                .await
                .unwrap(),
            1
        );
        let recent = store.created_since(t0 + ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(
            recent.iter().map(|r| r.title.as_str()).collect::<Vec<_>>(),
            vec!["new", "mid"]
        );
    }

    #[tokio::test]
    async fn query_filters_orders_and_paginates() {
        let store = Store::in_memory().await.unwrap();
        let t0 = Utc::now();
        insert(&store, "rust-async", "alice", 10, t0).await;
        insert(&store, "rust-sqlx", "bob", 50, t0 + ChronoDuration::seconds(1)).await;
        insert(&store, "go-tips", "alice", 30, t0 + ChronoDuration::seconds(2)).await;

        let top = store
            .query(&StoryFilter {
                order: StoryOrder::Top,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(top.total, 3);
        assert_eq!(top.stories[0].title, "rust-sqlx");

        let by_alice = store
            .query(&StoryFilter {
                author: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_alice.total, 2);
        assert_eq!(by_alice.stories[0].title, "go-tips");

        let rust_page2 = store
            .query(&StoryFilter {
                title: Some("rust".into()),
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rust_page2.total, 2);
        assert_eq!(rust_page2.count, 1);
        assert_eq!(rust_page2.page, 2);
        assert_eq!(rust_page2.total_pages, 2);
        assert_eq!(rust_page2.stories[0].title, "rust-async");
    }

    #[test]
    fn limit_is_clamped() {
        let f = StoryFilter {
            limit: Some(0),
            offset: Some(-3),
            ..Default::default()
        };
        assert_eq!(f.effective_limit(), 1);
        assert_eq!(f.effective_offset(), 0);
        let f = StoryFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(f.effective_limit(), MAX_PAGE_LIMIT);
    }
}
