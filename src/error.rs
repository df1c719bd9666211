//! Error taxonomy shared across providers and the delivery path.
//!
//! Upstream failures are *kinds*, not provider-specific types: the scheduler
//! and assembler only ever decide between "retry here", "placeholder this
//! block", and "stop scheduling this chat".

use std::time::Duration;

use thiserror::Error;

/// Failure of an external data provider (feeds, market, weather, holiday, AI).
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Worth one more try at the call site; never surfaced to the user.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Retries exhausted; the corresponding digest block renders a placeholder.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// Provider asked us to slow down.
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },
}

impl UpstreamError {
    pub fn transient(msg: impl Into<String>) -> Self {
        UpstreamError::Transient(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        UpstreamError::Unavailable(msg.into())
    }
}

/// Failure reported by the messaging transport.
///
/// `Unauthorized` and `ChatNotFound` are permanent for a given chat: the
/// subscriber is deactivated and no further deliveries are scheduled.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized")]
    Unauthorized,

    #[error("chat not found")]
    ChatNotFound,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// True when the chat should stop receiving messages entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized | TransportError::ChatNotFound
        )
    }

    /// True when the same send may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Transient(_) | TransportError::RateLimited { .. }
        )
    }
}
