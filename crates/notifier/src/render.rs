//! Turns a notification payload into the message an emitter sends.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use herald_common::types::{ChannelType, Notification};

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid blank line regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("payload field '{0}' is missing or not a string")]
    MissingField(&'static str),
    #[error("payload must be a JSON object")]
    NotAnObject,
}

fn field<'a>(payload: &'a Value, name: &'static str) -> Option<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required<'a>(payload: &'a Value, name: &'static str) -> Result<&'a str, RenderError> {
    field(payload, name).ok_or(RenderError::MissingField(name))
}

pub fn render(notification: &Notification) -> Result<RenderedMessage, RenderError> {
    let payload = &notification.payload;
    if !payload.is_object() {
        return Err(RenderError::NotAnObject);
    }

    match notification.channel_type {
        ChannelType::Email => {
            let subject = required(payload, "subject")?.to_string();
            let html = field(payload, "html").map(str::to_string);
            let text = match (field(payload, "body"), &html) {
                (Some(body), _) => body.to_string(),
                (None, Some(html)) => html_to_plain(html),
                (None, None) => subject.clone(),
            };
            Ok(RenderedMessage {
                subject: Some(subject),
                text,
                html,
            })
        }
        ChannelType::Sms => Ok(RenderedMessage {
            subject: None,
            text: required(payload, "body")?.to_string(),
            html: None,
        }),
        ChannelType::Push => {
            let title = required(payload, "title")?.to_string();
            let text = field(payload, "body").unwrap_or_default().to_string();
            Ok(RenderedMessage {
                subject: Some(title),
                text,
                html: None,
            })
        }
    }
}

/// Plain-text fallback for an HTML body.
pub fn html_to_plain(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, "");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");
    BLANK_LINES_RE
        .replace_all(&decoded, "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_common::types::NotificationStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn notification(channel_type: ChannelType, payload: Value) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            channel_type,
            recipient: "r".to_string(),
            payload,
            status: NotificationStatus::Queued,
            attempt_count: 0,
            next_retry_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            queued_at: Some(now),
            sent_at: None,
            failed_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_email_prefers_body_then_html() {
        let with_body = notification(
            ChannelType::Email,
            json!({"subject": "Hi", "body": "plain", "html": "<p>rich</p>"}),
        );
        let rendered = render(&with_body).unwrap();
        assert_eq!(rendered.subject.as_deref(), Some("Hi"));
        assert_eq!(rendered.text, "plain");
        assert_eq!(rendered.html.as_deref(), Some("<p>rich</p>"));

        let html_only = notification(
            ChannelType::Email,
            json!({"subject": "Hi", "html": "<p>Tom &amp; Jerry</p>"}),
        );
        assert_eq!(render(&html_only).unwrap().text, "Tom & Jerry");
    }

    #[test]
    fn test_missing_fields_are_errors() {
        let sms = notification(ChannelType::Sms, json!({"subject": "x"}));
        assert_eq!(render(&sms), Err(RenderError::MissingField("body")));

        let push = notification(ChannelType::Push, json!("just a string"));
        assert_eq!(render(&push), Err(RenderError::NotAnObject));
    }

    #[test]
    fn test_html_to_plain_collapses_blank_lines() {
        let text = html_to_plain("<h1>Title</h1>\n\n\n<p>a&nbsp;b</p>\n");
        assert_eq!(text, "Title\n\na b");
    }
}
