use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{EmitError, Emitter};
use crate::render::RenderedMessage;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Email delivery through the Resend HTTP API.
#[derive(Debug, Clone)]
pub struct ResendEmitter {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
}

impl ResendEmitter {
    pub fn new(api_key: String, from: String, timeout: Duration) -> Result<Self, EmitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmitError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_API_URL.to_string(),
            timeout,
        })
    }

    /// Point at a different API base, e.g. a local stub.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn transport_error(&self, e: reqwest::Error) -> EmitError {
        if e.is_timeout() {
            EmitError::Timeout(self.timeout)
        } else if e.is_connect() || e.is_request() {
            EmitError::Network(e.to_string())
        } else {
            EmitError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl Emitter for ResendEmitter {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(&self, recipient: &str, message: &RenderedMessage) -> Result<(), EmitError> {
        let body = SendEmailRequest {
            from: &self.from,
            to: [recipient],
            subject: message.subject.as_deref().unwrap_or_default(),
            text: &message.text,
            html: message.html.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(recipient, "Email accepted by Resend");
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {}>", e));

        if status.as_u16() == 422 && message.to_lowercase().contains("email") {
            return Err(EmitError::InvalidRecipient(recipient.to_string()));
        }

        Err(EmitError::Http {
            status: status.as_u16(),
            message,
        })
    }
}
