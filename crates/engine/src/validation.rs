//! Creation-time validation of recipients and payloads.
//!
//! Each channel has its own recipient format and a set of payload fields its
//! message template cannot render without.

use std::sync::LazyLock;

use regex::Regex;

use herald_common::error::AppError;
use herald_common::types::ChannelType;

/// RFC 5321 caps a forward path at 254 characters.
const MAX_EMAIL_LEN: usize = 254;
const MAX_DEVICE_TOKEN_LEN: usize = 4096;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("email pattern compiles")
});

static E164_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").expect("E.164 pattern compiles"));

/// Payload fields the channel's template requires.
pub fn required_payload_fields(channel_type: ChannelType) -> &'static [&'static str] {
    match channel_type {
        ChannelType::Email => &["subject"],
        ChannelType::Sms => &["body"],
        ChannelType::Push => &["title"],
    }
}

pub fn validate_recipient(channel_type: ChannelType, recipient: &str) -> Result<(), AppError> {
    let valid = match channel_type {
        ChannelType::Email => recipient.len() <= MAX_EMAIL_LEN && EMAIL_RE.is_match(recipient),
        ChannelType::Sms => E164_RE.is_match(recipient),
        ChannelType::Push => {
            !recipient.is_empty()
                && recipient.len() <= MAX_DEVICE_TOKEN_LEN
                && !recipient.chars().any(char::is_whitespace)
        }
    };

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid recipient '{}' for channel {}",
            recipient, channel_type
        )))
    }
}

pub fn validate_payload(
    channel_type: ChannelType,
    payload: &serde_json::Value,
) -> Result<(), AppError> {
    let object = payload
        .as_object()
        .ok_or_else(|| AppError::Validation("Payload must be a JSON object".to_string()))?;

    let missing: Vec<&str> = required_payload_fields(channel_type)
        .iter()
        .copied()
        .filter(|field| {
            object
                .get(*field)
                .and_then(|v| v.as_str())
                .is_none_or(|s| s.trim().is_empty())
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Payload for channel {} is missing required field(s): {}",
            channel_type,
            missing.join(", ")
        )))
    }
}
