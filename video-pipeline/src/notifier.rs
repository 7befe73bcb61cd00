use crate::config::NotificationTargets;
use crate::types::{FetchConfig, Result};
use crate::utils::markdown::escape_telegram;
use async_trait::async_trait;
use interfaces::{CapabilityError, CapabilityResult, ChannelKind, NotificationDispatcher, NotificationPayload};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const DISCORD_EMBED_COLOR: u32 = 16711680;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Delivers notifications through Discord/Slack webhooks and the Telegram
/// Bot API. Makes exactly one HTTP attempt per call.
pub struct WebhookNotifier {
    client: Client,
    targets: NotificationTargets,
}

impl WebhookNotifier {
    pub fn new(targets: NotificationTargets, fetch_config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&fetch_config.user_agent)
            .timeout(Duration::from_secs(fetch_config.timeout_seconds))
            .build()?;

        Ok(Self { client, targets })
    }

    fn endpoint(&self, kind: ChannelKind, payload: &NotificationPayload) -> CapabilityResult<(String, Value)> {
        let missing = |what: &str| CapabilityError::Configuration(format!("{} not configured", what));

        match kind {
            ChannelKind::Discord => {
                let url = self.targets.discord_webhook_url.clone().ok_or_else(|| missing("Discord webhook URL"))?;
                Ok((url, discord_body(payload)))
            }
            ChannelKind::Slack => {
                let url = self.targets.slack_webhook_url.clone().ok_or_else(|| missing("Slack webhook URL"))?;
                Ok((url, slack_body(payload)))
            }
            ChannelKind::Telegram => {
                let token = self.targets.telegram_bot_token.as_ref().ok_or_else(|| missing("Telegram bot token"))?;
                let chat_id = self.targets.telegram_chat_id.as_ref().ok_or_else(|| missing("Telegram chat id"))?;
                let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, token);
                Ok((url, telegram_body(chat_id, payload)))
            }
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotifier {
    async fn dispatch_notification(&self, channel_kind: ChannelKind, payload: &NotificationPayload) -> CapabilityResult<()> {
        let (url, body) = self.endpoint(channel_kind, payload)?;
        debug!("Posting {} notification for {}", channel_kind, payload.video_id);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::Transient(format!("{} request failed: {}", channel_kind, e.without_url())))?;

        classify_response(channel_kind, response.status())?;
        info!("Sent {} notification for {}", channel_kind, payload.video_id);
        Ok(())
    }
}

fn classify_response(kind: ChannelKind, status: StatusCode) -> CapabilityResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{} returned HTTP {}", kind, status.as_u16());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CapabilityError::Auth(message)),
        StatusCode::TOO_MANY_REQUESTS => Err(CapabilityError::Transient(message)),
        s if s.is_server_error() => Err(CapabilityError::Transient(message)),
        _ => Err(CapabilityError::InvalidInput(message)),
    }
}

pub fn discord_body(payload: &NotificationPayload) -> Value {
    let mut embed = json!({
        "title": payload.title,
        "description": payload.body,
        "url": payload.url,
        "color": DISCORD_EMBED_COLOR,
        "footer": { "text": payload.channel_name },
    });
    if let Some(thumbnail) = &payload.thumbnail {
        embed["thumbnail"] = json!({ "url": thumbnail });
    }
    json!({ "embeds": [embed] })
}

pub fn slack_body(payload: &NotificationPayload) -> Value {
    json!({
        "text": payload.title,
        "blocks": [
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*{}*\n{}", payload.title, payload.body) }
            },
            {
                "type": "actions",
                "elements": [
                    {
                        "type": "button",
                        "text": { "type": "plain_text", "text": "Watch Video" },
                        "url": payload.url
                    }
                ]
            }
        ]
    })
}

pub fn telegram_body(chat_id: &str, payload: &NotificationPayload) -> Value {
    let text = format!(
        "*{}*\n\n{}\n\n[Watch Video]({})",
        escape_telegram(&payload.title),
        escape_telegram(&payload.body),
        payload.url.replace('\\', "\\\\").replace(')', "%29")
    );
    json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "MarkdownV2",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> NotificationPayload {
        NotificationPayload {
            video_id: "dQw4w9WgXcQ".to_string(),
            title: "New: v2.0 release!".to_string(),
            body: "Summary (short)".to_string(),
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            channel_name: "Test Channel".to_string(),
            thumbnail: Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg".to_string()),
        }
    }

    #[test]
    fn discord_embed_carries_thumbnail() {
        let body = discord_body(&payload());
        assert_eq!(body["embeds"][0]["color"], 16711680);
        assert_eq!(body["embeds"][0]["thumbnail"]["url"], "https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg");
    }

    #[test]
    fn slack_has_watch_button() {
        let body = slack_body(&payload());
        assert_eq!(body["blocks"][1]["elements"][0]["url"], "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn telegram_text_is_escaped() {
        let body = telegram_body("42", &payload());
        let text = body["text"].as_str().unwrap();
        assert!(text.starts_with("*New: v2\\.0 release\\!*"));
        assert!(text.contains("Summary \\(short\\)"));
        assert_eq!(body["parse_mode"], "MarkdownV2");
    }

    #[test]
    fn status_codes_map_to_failure_kinds() {
        use interfaces::FailureKind;

        let kind_of = |status| classify_response(ChannelKind::Slack, status).unwrap_err().kind();
        assert_eq!(kind_of(StatusCode::FORBIDDEN), FailureKind::Configuration);
        assert_eq!(kind_of(StatusCode::TOO_MANY_REQUESTS), FailureKind::Transient);
        assert_eq!(kind_of(StatusCode::SERVICE_UNAVAILABLE), FailureKind::Transient);
        assert_eq!(kind_of(StatusCode::BAD_REQUEST), FailureKind::PermanentContent);
        assert!(classify_response(ChannelKind::Slack, StatusCode::NO_CONTENT).is_ok());
    }

    #[tokio::test]
    async fn missing_credentials_fail_as_configuration() {
        let notifier = WebhookNotifier::new(NotificationTargets::default(), &FetchConfig::default()).unwrap();
        let err = notifier
            .dispatch_notification(ChannelKind::Telegram, &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Configuration(_)));
    }
}
