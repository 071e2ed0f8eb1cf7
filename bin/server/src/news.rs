//! News feed assembly from channel history.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::cmp::Reverse;
use std::str::FromStr;
use thinkone_core::AccountKey;

/// Longest title taken from the first line of a post.
const TITLE_MAX_CHARS: usize = 120;

/// One post in the news feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsItem {
    pub id: String,
    pub channel_id: i64,
    pub channel_username: Option<String>,
    pub channel_title: String,
    pub title: String,
    pub text: String,
    pub source: String,
    #[serde(rename = "sourceUrl")]
    pub source_url: Option<String>,
    pub url: Option<String>,
    pub summary: Option<String>,
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub media: Option<JsonValue>,
}

/// A page of the news feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsList {
    pub total: usize,
    pub items: Vec<NewsItem>,
    pub next_offset: Option<u64>,
}

/// Feed ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    /// By source name, then newest first.
    Source,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "source" => Ok(Self::Source),
            other => Err(format!(
                "sort must be one of newest, oldest, source (got '{other}')"
            )),
        }
    }
}

/// First line of the text, cut to 120 characters, or `"Post"`.
#[must_use]
pub fn title_of(text: &str) -> String {
    let first_line: String = text
        .split('\n')
        .next()
        .unwrap_or_default()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect();
    if first_line.is_empty() {
        "Post".to_string()
    } else {
        first_line
    }
}

/// Converts a `fetch-history` result into feed items, skipping posts
/// without text.
#[must_use]
pub fn items_from_history(history: &JsonValue, account: &AccountKey) -> Vec<NewsItem> {
    let chat = &history["chat"];
    let channel_id = chat["id"].as_i64().unwrap_or_default();
    let username = chat["username"].as_str().map(str::to_string);
    let channel_title = chat["title"].as_str().unwrap_or("Channel").to_string();

    history["messages"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|message| {
            let text = message["text"].as_str().unwrap_or_default().trim();
            if text.is_empty() {
                return None;
            }
            let id = message["id"].as_u64()?;
            let published_at = message["date"]
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or_default();
            Some(NewsItem {
                id: id.to_string(),
                channel_id,
                channel_username: username.clone(),
                channel_title: channel_title.clone(),
                title: title_of(text),
                text: text.to_string(),
                source: channel_title.clone(),
                source_url: username.as_ref().map(|u| format!("https://t.me/{u}")),
                url: None,
                summary: None,
                published_at,
                tags: Vec::new(),
                media: media_of(&message["media"], account),
            })
        })
        .collect()
}

fn media_of(media: &JsonValue, account: &AccountKey) -> Option<JsonValue> {
    let kind = media["kind"].as_str()?;
    let file_id = media["file_id"].as_str()?;
    Some(json!({
        "kind": kind,
        "proxyUrl": format!("/api/tg/media/{file_id}?account={account}"),
        "mime": media["mime"],
        "size": media["size"],
    }))
}

/// Sorts, truncates and pages the merged items.
#[must_use]
pub fn assemble(mut items: Vec<NewsItem>, sort: SortOrder, limit: usize) -> NewsList {
    match sort {
        SortOrder::Newest => items.sort_by_key(|item| Reverse(item.published_at)),
        SortOrder::Oldest => items.sort_by_key(|item| item.published_at),
        SortOrder::Source => {
            items.sort_by_key(|item| Reverse((item.source.to_lowercase(), item.published_at)));
        }
    }
    items.truncate(limit);
    let next_offset = items
        .iter()
        .filter_map(|item| item.id.parse::<u64>().ok())
        .min();
    NewsList {
        total: items.len(),
        items,
        next_offset,
    }
}

/// Formats per-channel failures as `channel:reason; ...`.
///
/// Characters that cannot appear in a header value are replaced.
#[must_use]
pub fn errors_header(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(channel, reason)| format!("{channel}:{reason}"))
        .collect::<Vec<_>>()
        .join("; ")
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountKey {
        AccountKey::new("news-bot").expect("valid key")
    }

    fn item(id: &str, source: &str, secs: i64) -> NewsItem {
        NewsItem {
            id: id.to_string(),
            channel_id: 1,
            channel_username: None,
            channel_title: source.to_string(),
            title: "t".to_string(),
            text: "t".to_string(),
            source: source.to_string(),
            source_url: None,
            url: None,
            summary: None,
            published_at: Utc.timestamp_opt(secs, 0).single().expect("valid time"),
            tags: Vec::new(),
            media: None,
        }
    }

    #[test]
    fn titles_use_first_line() {
        assert_eq!(title_of("Headline\nbody text"), "Headline");
        assert_eq!(title_of("\nbody only"), "Post");
        assert_eq!(title_of(&"x".repeat(200)).chars().count(), 120);
    }

    #[test]
    fn history_maps_to_items() {
        let history = json!({
            "chat": { "id": -100, "title": "Daily", "username": "daily" },
            "messages": [
                { "id": 12, "date": 1_700_000_000, "text": "Big news\nDetails", "media": null },
                { "id": 11, "date": 1_699_999_000, "text": "   ", "media": null },
                { "id": 10, "date": 1_699_998_000, "text": "Photo post",
                  "media": { "kind": "photo", "file_id": "abc", "mime": "image/jpeg", "size": 10 } },
            ]
        });

        let items = items_from_history(&history, &account());

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Big news");
        assert_eq!(items[0].source_url.as_deref(), Some("https://t.me/daily"));
        assert_eq!(items[0].channel_id, -100);
        let media = items[1].media.as_ref().expect("media");
        assert_eq!(media["proxyUrl"], "/api/tg/media/abc?account=news-bot");

        let json = serde_json::to_value(&items[0]).expect("serialize");
        assert!(json.get("publishedAt").is_some());
        assert!(json.get("sourceUrl").is_some());
    }

    #[test]
    fn sorting_and_paging() {
        let items = vec![item("5", "beta", 100), item("9", "Alpha", 300), item("7", "beta", 200)];

        let newest = assemble(items.clone(), SortOrder::Newest, 2);
        let ids: Vec<&str> = newest.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["9", "7"]);
        assert_eq!(newest.total, 2);
        assert_eq!(newest.next_offset, Some(7));

        let oldest = assemble(items.clone(), SortOrder::Oldest, 10);
        assert_eq!(oldest.items[0].id, "5");

        let by_source = assemble(items, SortOrder::Source, 10);
        let ids: Vec<&str> = by_source.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["7", "5", "9"]);
    }

    #[test]
    fn empty_feed_has_no_offset() {
        let list = assemble(Vec::new(), SortOrder::Newest, 30);
        assert_eq!(list.total, 0);
        assert_eq!(list.next_offset, None);
    }

    #[test]
    fn sort_order_parsing() {
        assert_eq!("oldest".parse::<SortOrder>(), Ok(SortOrder::Oldest));
        assert!("random".parse::<SortOrder>().is_err());
    }

    #[test]
    fn error_header_is_header_safe() {
        let header = errors_header(&[
            ("durov".to_string(), "chat not found".to_string()),
            ("новости".to_string(), "bad\nname".to_string()),
        ]);
        assert_eq!(header, "durov:chat not found; ???????:bad?name");
    }
}
