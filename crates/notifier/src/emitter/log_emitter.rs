use async_trait::async_trait;

use super::{EmitError, Emitter};
use crate::render::RenderedMessage;

/// Writes messages to the log instead of delivering them. Used for local runs
/// without provider credentials.
#[derive(Debug, Default)]
pub struct LogEmitter;

impl LogEmitter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Emitter for LogEmitter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, recipient: &str, message: &RenderedMessage) -> Result<(), EmitError> {
        tracing::info!(
            recipient,
            subject = message.subject.as_deref().unwrap_or_default(),
            chars = message.text.len(),
            "Message logged instead of delivered"
        );
        Ok(())
    }
}
