use crate::types::{watch_url, FetchConfig, PipelineError, Result};
use async_trait::async_trait;
use interfaces::{CapabilityError, CapabilityResult, Transcript, TranscriptSegment, TranscriptSource};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const PLAYER_API_URL: &str = "https://www.youtube.com/youtubei/v1/player?key=";
const CLIENT_NAME: &str = "WEB";
const CLIENT_VERSION: &str = "2.20230804.00.00";
const CONSENT_FORM: &str = "action=\"https://consent.youtube.com/s\"";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    #[serde(default)]
    playability_status: Option<PlayabilityStatus>,
    #[serde(default)]
    captions: Option<Captions>,
}

#[derive(Debug, Default, Deserialize)]
struct PlayabilityStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Captions {
    #[serde(rename = "playerCaptionsTracklistRenderer", default)]
    renderer: Option<TracklistRenderer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TracklistRenderer {
    #[serde(default)]
    caption_tracks: Vec<CaptionTrack>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptionTrack {
    base_url: String,
    language_code: String,
    /// `asr` for generated captions.
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Json3 {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
struct Json3Event {
    #[serde(rename = "tStartMs", default)]
    start_ms: u64,
    #[serde(rename = "dDurationMs", default)]
    duration_ms: u64,
    #[serde(default)]
    segs: Vec<Json3Segment>,
}

#[derive(Debug, Deserialize)]
struct Json3Segment {
    #[serde(default)]
    utf8: String,
}

/// Fetches caption tracks through the public watch page and player endpoint.
pub struct YouTubeTranscriptSource {
    client: Client,
    languages: Vec<String>,
    api_key_pattern: Regex,
    consent_pattern: Regex,
}

impl YouTubeTranscriptSource {
    pub fn new(fetch_config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&fetch_config.user_agent)
            .timeout(Duration::from_secs(fetch_config.timeout_seconds))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            languages: vec!["en".to_string()],
            api_key_pattern: compile(r#""INNERTUBE_API_KEY":\s*"([a-zA-Z0-9_-]+)""#)?,
            consent_pattern: compile(r#"name="v" value="(.*?)""#)?,
        })
    }

    /// Preferred caption languages, most preferred first.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    async fn get_text(&self, url: &str, cookie: Option<&str>) -> CapabilityResult<String> {
        let mut request = self.client.get(url).header("Accept-Language", "en-US");
        if let Some(cookie) = cookie {
            request = request.header("Cookie", cookie);
        }
        let response = request.send().await.map_err(transport_error)?;
        check_status(response.status(), url)?;
        response.text().await.map_err(transport_error)
    }

    async fn fetch_watch_html(&self, video_id: &str) -> CapabilityResult<String> {
        let url = watch_url(video_id);
        let html = self.get_text(&url, None).await?;
        if !html.contains(CONSENT_FORM) {
            return Ok(html);
        }

        debug!("Consent page for {}, retrying with consent cookie", video_id);
        let consent_value = self
            .consent_pattern
            .captures(&html)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| CapabilityError::Restricted(format!("consent required for {}", video_id)))?;

        let cookie = format!("CONSENT=YES+{}", consent_value);
        let html = self.get_text(&url, Some(&cookie)).await?;
        if html.contains(CONSENT_FORM) {
            return Err(CapabilityError::Restricted(format!("consent required for {}", video_id)));
        }
        Ok(html)
    }

    fn extract_api_key(&self, html: &str, video_id: &str) -> CapabilityResult<String> {
        if let Some(captures) = self.api_key_pattern.captures(html) {
            if let Some(key) = captures.get(1) {
                return Ok(key.as_str().to_string());
            }
        }
        if html.contains("class=\"g-recaptcha\"") {
            return Err(CapabilityError::Transient(format!("request for {} was blocked", video_id)));
        }
        Err(CapabilityError::NotAvailable(format!("watch page for {} is unparsable", video_id)))
    }

    async fn fetch_player(&self, api_key: &str, video_id: &str) -> CapabilityResult<PlayerResponse> {
        let url = format!("{}{}", PLAYER_API_URL, api_key);
        let body = json!({
            "context": { "client": { "clientName": CLIENT_NAME, "clientVersion": CLIENT_VERSION } },
            "videoId": video_id,
        });

        let response = self.client.post(&url).json(&body).send().await.map_err(transport_error)?;
        check_status(response.status(), "player endpoint")?;
        response
            .json::<PlayerResponse>()
            .await
            .map_err(|e| CapabilityError::NotAvailable(format!("player response for {} unparsable: {}", video_id, e)))
    }

    fn select_track<'a>(&self, tracks: &'a [CaptionTrack]) -> Option<&'a CaptionTrack> {
        for language in &self.languages {
            let manual = tracks
                .iter()
                .find(|t| track_matches(t, language) && !is_generated(t));
            if let Some(track) = manual.or_else(|| tracks.iter().find(|t| track_matches(t, language))) {
                return Some(track);
            }
        }
        None
    }
}

fn track_matches(track: &CaptionTrack, language: &str) -> bool {
    track.language_code == language || track.language_code.starts_with(&format!("{}-", language))
}

fn is_generated(track: &CaptionTrack) -> bool {
    track.kind.as_deref() == Some("asr")
}

#[async_trait]
impl TranscriptSource for YouTubeTranscriptSource {
    async fn fetch_transcript(&self, video_id: &str) -> CapabilityResult<Transcript> {
        let html = self.fetch_watch_html(video_id).await?;
        let api_key = self.extract_api_key(&html, video_id)?;
        let player = self.fetch_player(&api_key, video_id).await?;

        check_playability(player.playability_status.as_ref(), video_id)?;

        let tracks = player
            .captions
            .and_then(|captions| captions.renderer)
            .map(|renderer| renderer.caption_tracks)
            .unwrap_or_default();
        if tracks.is_empty() {
            return Err(CapabilityError::NotAvailable(format!("transcripts are disabled for {}", video_id)));
        }

        let track = self.select_track(&tracks).ok_or_else(|| {
            CapabilityError::NotAvailable(format!("no transcript in {:?} for {}", self.languages, video_id))
        })?;

        let url = format!("{}&fmt=json3", track.base_url.replace("&fmt=srv3", ""));
        let body = self.get_text(&url, None).await?;
        let transcript = parse_json3(&body)?;

        if transcript.is_empty() {
            return Err(CapabilityError::NotAvailable(format!("empty transcript for {}", video_id)));
        }

        info!("Fetched {} transcript segments for {} ({})", transcript.segments.len(), video_id, track.language_code);
        Ok(transcript)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("invalid pattern {}: {}", pattern, e)))
}

fn transport_error(error: reqwest::Error) -> CapabilityError {
    CapabilityError::Transient(error.to_string())
}

fn check_status(status: StatusCode, what: &str) -> CapabilityResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("HTTP {} from {}", status.as_u16(), what);
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => Err(CapabilityError::Transient(message)),
        s if s.is_server_error() => Err(CapabilityError::Transient(message)),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(CapabilityError::NotAvailable(message)),
        _ => Err(CapabilityError::Restricted(message)),
    }
}

fn check_playability(status: Option<&PlayabilityStatus>, video_id: &str) -> CapabilityResult<()> {
    let Some(status) = status else {
        return Ok(());
    };
    let reason = status.reason.clone().unwrap_or_default();

    match status.status.as_deref() {
        None | Some("OK") => Ok(()),
        Some("LOGIN_REQUIRED") => Err(CapabilityError::Restricted(format!(
            "{} requires sign-in (age restricted or private): {}",
            video_id, reason
        ))),
        Some("ERROR") => Err(CapabilityError::NotAvailable(format!("{} is unavailable: {}", video_id, reason))),
        Some(other) => Err(CapabilityError::Restricted(format!("{} is unplayable ({}): {}", video_id, other, reason))),
    }
}

fn parse_json3(body: &str) -> CapabilityResult<Transcript> {
    let parsed: Json3 = serde_json::from_str(body)
        .map_err(|e| CapabilityError::NotAvailable(format!("caption track unparsable: {}", e)))?;

    let segments = parsed
        .events
        .into_iter()
        .filter_map(|event| {
            let text: String = event.segs.iter().map(|seg| seg.utf8.as_str()).collect();
            let text = text.replace('\n', " ").trim().to_string();
            (!text.is_empty()).then(|| TranscriptSegment {
                start: event.start_ms as f64 / 1000.0,
                duration: event.duration_ms as f64 / 1000.0,
                text,
            })
        })
        .collect();

    Ok(Transcript::new(segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(language_code: &str, kind: Option<&str>) -> CaptionTrack {
        CaptionTrack {
            base_url: format!("https://example.test/{}", language_code),
            language_code: language_code.to_string(),
            kind: kind.map(str::to_string),
        }
    }

    #[test]
    fn json3_events_become_segments() {
        let body = r#"{"events": [
            {"tStartMs": 0, "dDurationMs": 1500},
            {"tStartMs": 1500, "dDurationMs": 2000, "segs": [{"utf8": "hello"}, {"utf8": " world"}]},
            {"tStartMs": 3500, "dDurationMs": 1000, "segs": [{"utf8": "\n"}]},
            {"tStartMs": 4500, "dDurationMs": 1000, "segs": [{"utf8": "second\nline"}]}
        ]}"#;

        let transcript = parse_json3(body).unwrap();
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[0].start, 1.5);
        assert_eq!(transcript.segments[0].text, "hello world");
        assert_eq!(transcript.segments[1].text, "second line");
        assert!(matches!(parse_json3("<xml/>"), Err(CapabilityError::NotAvailable(_))));
    }

    #[test]
    fn manual_tracks_win_over_generated() {
        let source = YouTubeTranscriptSource::new(&FetchConfig::default()).unwrap();
        let tracks = vec![track("de", None), track("en", Some("asr")), track("en-GB", None)];
        assert_eq!(source.select_track(&tracks).unwrap().language_code, "en-GB");

        let generated_only = vec![track("en", Some("asr"))];
        assert_eq!(source.select_track(&generated_only).unwrap().language_code, "en");
        assert!(source.select_track(&[track("fr", None)]).is_none());

        let french_first = source.with_languages(vec!["fr".to_string(), "en".to_string()]);
        let mixed = vec![track("en", None), track("fr-CA", Some("asr"))];
        assert_eq!(french_first.select_track(&mixed).unwrap().language_code, "fr-CA");
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(check_status(StatusCode::TOO_MANY_REQUESTS, "x"), Err(CapabilityError::Transient(_))));
        assert!(matches!(check_status(StatusCode::BAD_GATEWAY, "x"), Err(CapabilityError::Transient(_))));
        assert!(matches!(check_status(StatusCode::NOT_FOUND, "x"), Err(CapabilityError::NotAvailable(_))));

        let login = PlayabilityStatus {
            status: Some("LOGIN_REQUIRED".to_string()),
            reason: Some("Sign in to confirm your age".to_string()),
        };
        assert!(matches!(check_playability(Some(&login), "abc"), Err(CapabilityError::Restricted(_))));
        assert!(check_playability(None, "abc").is_ok());
    }

    #[test]
    fn api_key_is_read_from_watch_page() {
        let source = YouTubeTranscriptSource::new(&FetchConfig::default()).unwrap();
        let html = r#"<script>ytcfg.set({"INNERTUBE_API_KEY": "AIzaSyA-test_key"});</script>"#;
        assert_eq!(source.extract_api_key(html, "abc").unwrap(), "AIzaSyA-test_key");
        assert!(matches!(
            source.extract_api_key("<div class=\"g-recaptcha\"></div>", "abc"),
            Err(CapabilityError::Transient(_))
        ));
    }
}
