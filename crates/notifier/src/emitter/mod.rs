//! Delivery providers.
//!
//! An [`Emitter`] sends one rendered message to one recipient. Its error is
//! classified into an [`AttemptOutcome`] so the pipeline knows whether the
//! attempt is worth repeating.

mod log_emitter;
mod resend;

pub use log_emitter::LogEmitter;
pub use resend::ResendEmitter;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{AttemptOutcome, ChannelType};

use crate::render::RenderedMessage;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid email recipient rejected: {0}")]
    InvalidRecipient(String),

    #[error("{0}")]
    Other(String),
}

impl EmitError {
    /// Map the error onto the retry decision.
    ///
    /// Network problems, timeouts, 5xx and 429 are worth another attempt.
    /// A rejected recipient or a request the provider will never accept is
    /// not. Anything unrecognised is treated as transient.
    pub fn classify(&self) -> AttemptOutcome {
        let message = self.to_string();
        match self {
            EmitError::Timeout(_) | EmitError::Network(_) | EmitError::Other(_) => {
                AttemptOutcome::TransientFailure(message)
            }
            EmitError::InvalidRecipient(_) => AttemptOutcome::PermanentFailure(message),
            EmitError::Http { status, .. } => match status {
                429 | 500..=599 => AttemptOutcome::TransientFailure(message),
                400 | 403 | 404 | 422 => AttemptOutcome::PermanentFailure(message),
                _ => AttemptOutcome::TransientFailure(message),
            },
        }
    }
}

#[async_trait]
pub trait Emitter: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &'static str;

    async fn send(&self, recipient: &str, message: &RenderedMessage) -> Result<(), EmitError>;
}

/// Emitters by channel. A channel without one cannot be delivered.
#[derive(Clone, Default)]
pub struct EmitterRegistry {
    emitters: HashMap<ChannelType, Arc<dyn Emitter>>,
}

impl EmitterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel_type: ChannelType, emitter: Arc<dyn Emitter>) -> Self {
        self.register(channel_type, emitter);
        self
    }

    pub fn register(&mut self, channel_type: ChannelType, emitter: Arc<dyn Emitter>) {
        tracing::info!(%channel_type, emitter = emitter.name(), "Emitter registered");
        self.emitters.insert(channel_type, emitter);
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<&Arc<dyn Emitter>> {
        self.emitters.get(&channel_type)
    }
}
