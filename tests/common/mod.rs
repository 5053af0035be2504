// tests/common/mod.rs
// Shared helpers: synthetic listing pages and in-process story fixtures.
#![allow(dead_code)]

use chrono::Utc;
use hn_story_stream::ingest::types::Item;

/// One listing row: (title, url, author, points).
pub type Row<'a> = (&'a str, &'a str, &'a str, u32);

/// Render rows the way the live listing lays them out (item row + subtext row).
pub fn listing_html(rows: &[Row<'_>]) -> String {
    let mut body = String::from("<html><body><table class=\"itemlist\">\n");
    for (i, (title, url, author, points)) in rows.iter().enumerate() {
        body.push_str(&format!(
            "<tr class=\"athing\" id=\"{i}\"><td class=\"title\"><span class=\"titleline\">\
             <a href=\"{url}\">{title}</a></span></td></tr>\n\
             <tr><td class=\"subtext\"><span class=\"score\">{points} points</span> by \
             <a href=\"user?id={author}\" class=\"hnuser\">{author}</a></td></tr>\n\
             <tr class=\"spacer\"></tr>\n"
        ));
    }
    body.push_str("</table></body></html>\n");
    body
}

pub fn item(title: &str, url: &str, author: &str, points: u32) -> Item {
    Item {
        title: title.to_string(),
        url: Some(url.to_string()),
        author: author.to_string(),
        points,
        observed_at: Utc::now(),
    }
}
