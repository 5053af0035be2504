// src/ingest/persist.rs
//! Two-stage dedup (in-batch, then against the store) and the transactional
//! insert of whatever is left.

use std::collections::{HashMap, HashSet};

use metrics::counter;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

use crate::ingest::types::{IdentityKey, Item};
use crate::store::Store;

/// Keys per existence lookup (2 binds each).
const LOOKUP_CHUNK: usize = 400;
/// Rows per multi-row insert (5 binds each).
const INSERT_CHUNK: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Transaction,
    Lookup,
    Insert,
}

#[derive(Debug, Error)]
#[error("persist failed during {phase:?}: {source}")]
pub struct PersistenceError {
    pub phase: Phase,
    #[source]
    pub source: sqlx::Error,
}

impl PersistenceError {
    fn at(phase: Phase) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self { phase, source }
    }
}

/// Outcome of one persist call, for logs and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub received: usize,
    /// Dropped for lacking url or author.
    pub incomplete: usize,
    /// Removed because another item in the same batch had the same key.
    pub batch_duplicates: usize,
    /// Skipped because the key is already stored.
    pub existing: usize,
    pub inserted: usize,
    /// The transaction was rolled back; nothing from this batch was written.
    pub failed: bool,
}

/// Keep one item per identity key, dropping items without one.
/// Returns (unique items, incomplete count, duplicate count).
pub fn collapse_batch(items: Vec<Item>) -> (Vec<(IdentityKey, Item)>, usize, usize) {
    let mut incomplete = 0usize;
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        match item.identity_key() {
            Some(key) => keyed.push((key, item)),
            None => incomplete += 1,
        }
    }

    let complete = keyed.len();
    // Last occurrence wins, listing order of first occurrence is kept.
    let mut slot: HashMap<IdentityKey, usize> = HashMap::with_capacity(complete);
    let mut unique: Vec<(IdentityKey, Item)> = Vec::with_capacity(complete);
    for (key, item) in keyed {
        match slot.get(&key) {
            Some(&i) => unique[i].1 = item,
            None => {
                slot.insert(key.clone(), unique.len());
                unique.push((key, item));
            }
        }
    }

    let duplicates = complete - unique.len();
    (unique, incomplete, duplicates)
}

/// Writes scraped items to the store, inserting only keys it has not seen.
#[derive(Clone)]
pub struct Persister {
    store: Store,
}

impl Persister {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Never fails: storage errors are logged, counted, and reported via `failed`.
    pub async fn persist(&self, items: Vec<Item>, source: &str) -> PersistReport {
        let received = items.len();
        let (unique, incomplete, batch_duplicates) = collapse_batch(items);
        let mut report = PersistReport {
            received,
            incomplete,
            batch_duplicates,
            ..Default::default()
        };
        tracing::info!(
            source,
            received,
            incomplete,
            batch_duplicates,
            "starting store save"
        );

        match self.write_new(unique).await {
            Ok((existing, inserted)) => {
                report.existing = existing;
                report.inserted = inserted;
                if inserted == 0 {
                    tracing::info!(source, existing, "all stories already stored, nothing to save");
                } else {
                    tracing::info!(source, inserted, existing, "new stories saved");
                }
            }
            Err(e) => {
                report.failed = true;
                counter!("persist_errors_total", "source" => source.to_string()).increment(1);
                tracing::error!(source, error = %e, "store save rolled back");
            }
        }

        counter!("persist_inserted_total", "source" => source.to_string()).increment(report.inserted as u64);
        counter!("persist_existing_total", "source" => source.to_string()).increment(report.existing as u64);
        counter!("persist_batch_duplicates_total", "source" => source.to_string())
            .increment(report.batch_duplicates as u64);
        counter!("persist_incomplete_total", "source" => source.to_string()).increment(report.incomplete as u64);
        report
    }

    /// Lookup + insert in one transaction. Dropping `tx` on an error path rolls back.
    async fn write_new(&self, unique: Vec<(IdentityKey, Item)>) -> Result<(usize, usize), PersistenceError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(PersistenceError::at(Phase::Transaction))?;

        let result = async {
            let keys: Vec<&IdentityKey> = unique.iter().map(|(k, _)| k).collect();
            let existing = existing_keys(&mut tx, &keys).await?;
            let fresh: Vec<&(IdentityKey, Item)> = unique.iter().filter(|(k, _)| !existing.contains(k)).collect();
            insert_items(&mut tx, &fresh).await?;
            Ok::<_, PersistenceError>((unique.len() - fresh.len(), fresh.len()))
        }
        .await;

        match result {
            Ok(counts) => {
                tx.commit().await.map_err(PersistenceError::at(Phase::Transaction))?;
                Ok(counts)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn existing_keys(
    conn: &mut SqliteConnection,
    keys: &[&IdentityKey],
) -> Result<HashSet<IdentityKey>, PersistenceError> {
    let mut found = HashSet::new();
    for chunk in keys.chunks(LOOKUP_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT url, author FROM stories WHERE (url, author) IN (VALUES ",
        );
        for (i, key) in chunk.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(")
                .push_bind(key.url.clone())
                .push(", ")
                .push_bind(key.author.clone())
                .push(")");
        }
        qb.push(")");

        let rows = qb
            .build_query_as::<(String, String)>()
            .fetch_all(&mut *conn)
            .await
            .map_err(PersistenceError::at(Phase::Lookup))?;
        found.extend(rows.into_iter().map(|(url, author)| IdentityKey { url, author }));
    }
    Ok(found)
}

/// Url and author are written as their normalised key so later lookups match.
async fn insert_items(conn: &mut SqliteConnection, items: &[&(IdentityKey, Item)]) -> Result<(), PersistenceError> {
    for chunk in items.chunks(INSERT_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO stories (title, url, author, points, created_at) ",
        );
        qb.push_values(chunk, |mut row, (key, item)| {
            row.push_bind(item.title.clone())
                .push_bind(key.url.clone())
                .push_bind(key.author.clone())
                .push_bind(i64::from(item.points))
                .push_bind(item.observed_at);
        });
        qb.build()
            .execute(&mut *conn)
            .await
            .map_err(PersistenceError::at(Phase::Insert))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(title: &str, url: Option<&str>, author: &str) -> Item {
        Item {
            title: title.into(),
            url: url.map(str::to_string),
            author: author.into(),
            points: 1,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn collapse_counts_incomplete_and_duplicates() {
        let batch = vec![
            item("a", Some("u1"), "x"),
            item("a2", Some("u1"), "x"),
            item("b", Some("u2"), "y"),
            item("c", None, "z"),
            item("d", Some("u3"), crate::ingest::types::UNKNOWN_AUTHOR),
        ];
        let (unique, incomplete, dups) = collapse_batch(batch);
        assert_eq!(incomplete, 2);
        assert_eq!(dups, 1);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].0.url, "u1");
        assert_eq!(unique[1].0.url, "u2");
    }

    #[test]
    fn same_url_different_author_is_distinct() {
        let (unique, _, dups) = collapse_batch(vec![
            item("a", Some("u1"), "x"),
            item("b", Some("u1"), "y"),
        ]);
        assert_eq!(unique.len(), 2);
        assert_eq!(dups, 0);
    }
}
