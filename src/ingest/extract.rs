// src/ingest/extract.rs
//! Listing-page extraction: one fetched document in, item records out.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::ingest::types::{Item, UNKNOWN_AUTHOR};

static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr.athing").expect("row selector"));
static TITLE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".titleline > a").expect("title selector"));
static SUBTEXT: Lazy<Selector> = Lazy::new(|| Selector::parse(".subtext").expect("subtext selector"));
static SCORE: Lazy<Selector> = Lazy::new(|| Selector::parse(".score").expect("score selector"));
static AUTHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a.hnuser").expect("author selector"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+)").expect("int regex"));

/// Extract every listing row of `html`, stamping each item with `observed_at`.
///
/// Malformed rows degrade to sentinel fields (empty title, no url, unknown author,
/// zero points) instead of being dropped or failing the batch.
pub fn extract_items(html: &str, observed_at: DateTime<Utc>) -> Vec<Item> {
    let document = Html::parse_document(html);
    let mut out = Vec::new();

    for row in document.select(&ROW) {
        let link = row.select(&TITLE_LINK).next();
        let title = link.map(|a| collapse_ws(&a.text().collect::<String>())).unwrap_or_default();
        let url = link
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);

        let subtext = next_row(row).and_then(|tr| tr.select(&SUBTEXT).next());
        let author = subtext
            .and_then(|s| s.select(&AUTHOR).next())
            .map(|a| a.text().collect::<String>().trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
        let points = subtext
            .and_then(|s| s.select(&SCORE).next())
            .map(|s| parse_points(&s.text().collect::<String>()))
            .unwrap_or(0);

        if author == UNKNOWN_AUTHOR {
            tracing::debug!(title = %truncate(&title, 50), "listing row without author");
        } else {
            tracing::trace!(title = %truncate(&title, 50), %author, points, "listing row");
        }

        out.push(Item {
            title,
            url,
            author,
            points,
            observed_at,
        });
    }

    out
}

/// Subtext lives in the table row right after the item row.
fn next_row(row: ElementRef<'_>) -> Option<ElementRef<'_>> {
    row.next_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|el| el.value().name() == "tr")
}

/// "123 points" -> 123; anything without a leading integer -> 0.
fn parse_points(s: &str) -> u32 {
    RE_LEADING_INT
        .captures(s)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn collapse_ws(s: &str) -> String {
    RE_WS.replace_all(s, " ").trim().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
