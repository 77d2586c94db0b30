//! Model backend errors with retry classification.

use std::time::Duration;

/// Errors returned by the chat-completion backend.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LlmError {
    /// The backend asked us to slow down (HTTP 429).
    #[error("Rate limited by model backend: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The backend failed (HTTP 5xx).
    #[error("Model backend error {status}: {message}")]
    Server { status: u16, message: String },

    /// The request was rejected (HTTP 4xx other than 429).
    #[error("Model request rejected with {status}: {message}")]
    Client { status: u16, message: String },

    /// Connection failure or timeout.
    #[error("Network error talking to model backend: {message}")]
    Network { message: String },

    /// The response body could not be understood.
    #[error("Unexpected model response: {message}")]
    Parse { message: String },
}

impl LlmError {
    /// Classifies a non-success HTTP response.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited {
                message: body,
                retry_after,
            },
            500..=599 => Self::Server {
                status,
                message: body,
            },
            _ => Self::Client {
                status,
                message: body,
            },
        }
    }

    /// Transient errors are worth retrying; rejected requests and bad bodies are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network { .. }
        )
    }

    /// Delay before retry `attempt` (0-based): the server's hint when given,
    /// otherwise exponential backoff of 1s, 2s, 4s... capped at 30s.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if let Self::RateLimited {
            retry_after: Some(delay),
            ..
        } = self
        {
            return *delay;
        }
        Duration::from_secs((1u64 << attempt.min(5)).min(30))
    }
}
