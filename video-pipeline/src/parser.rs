use crate::types::{watch_url, Candidate, PipelineError, Result};
use feed_rs::model::Entry;
use feed_rs::parser;
use tracing::debug;
use url::Url;

const NAMESPACED_PREFIX: &str = "yt:video:";
const CANONICAL_ID_LEN: usize = 11;
const PATH_ID_KINDS: [&str; 4] = ["shorts", "embed", "live", "v"];

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_canonical_id(value: &str) -> bool {
    value.len() == CANONICAL_ID_LEN && value.chars().all(is_id_char)
}

fn malformed(value: &str) -> PipelineError {
    PipelineError::MalformedEntry(format!("no video id in '{}'", value))
}

/// Recover a video id from a bare id, a watch/short link, or the feed's
/// namespaced `yt:video:ID` form.
pub fn extract_video_id(value: &str) -> Result<String> {
    let value = value.trim();

    if let Some(token) = value.strip_prefix(NAMESPACED_PREFIX) {
        if !token.is_empty() && token.chars().all(is_id_char) {
            return Ok(token.to_string());
        }
        return Err(malformed(value));
    }

    if is_canonical_id(value) {
        return Ok(value.to_string());
    }

    let with_scheme = if value.contains("://") {
        value.to_string()
    } else if value.starts_with("youtu") || value.starts_with("www.") || value.starts_with("m.") {
        format!("https://{}", value)
    } else {
        return Err(malformed(value));
    };

    let parsed = Url::parse(&with_scheme).map_err(|_| malformed(value))?;
    let host = parsed.host_str().unwrap_or("").trim_start_matches("www.");
    let mut segments = parsed.path_segments().into_iter().flatten().filter(|s| !s.is_empty());

    let candidate = match host {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            match segments.next() {
                Some("watch") => parsed
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, id)| id.into_owned()),
                Some(kind) if PATH_ID_KINDS.contains(&kind) => segments.next().map(str::to_string),
                _ => None,
            }
        }
        _ => None,
    };

    match candidate {
        Some(id) if is_canonical_id(&id) => Ok(id),
        _ => Err(malformed(value)),
    }
}

/// A parsed feed document whose entries have not been converted yet.
pub struct ParsedFeed {
    pub title: Option<String>,
    pub entries: Vec<Entry>,
}

pub struct FeedParser;

impl FeedParser {
    pub fn parse_feed(content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| PipelineError::MalformedEntry(format!("Failed to parse feed: {}", e)))?;

        Ok(ParsedFeed {
            title: feed.title.map(|t| t.content),
            entries: feed.entries,
        })
    }

    /// Convert one feed entry into a candidate for `channel_id`.
    pub fn parse_entry(entry: &Entry, channel_id: &str) -> Result<Candidate> {
        let first_link = entry.links.first().map(|link| link.href.as_str());

        let video_id = entry
            .id
            .starts_with(NAMESPACED_PREFIX)
            .then(|| extract_video_id(&entry.id))
            .and_then(|result| result.ok())
            .or_else(|| first_link.and_then(|href| extract_video_id(href).ok()))
            .map_or_else(|| extract_video_id(&entry.id), Ok)?;

        let published_at = entry
            .published
            .or(entry.updated)
            .ok_or_else(|| PipelineError::MalformedEntry(format!("entry {} has no timestamp", video_id)))?;

        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let url = first_link
            .filter(|href| href.starts_with("http"))
            .map(str::to_string)
            .unwrap_or_else(|| watch_url(&video_id));

        Ok(Candidate {
            video_id,
            channel_id: channel_id.to_string(),
            title,
            published_at,
            url,
        })
    }
}
