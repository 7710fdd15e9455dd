//! Error types for the Anthropic Messages client.
//!
//! [`AnthropicError`] separates rate limiting, model lookup failures, other
//! API errors and transport errors, so callers can decide what is worth
//! retrying.

use thiserror::Error;

/// Errors that can occur while talking to the Anthropic API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// HTTP 429. `retry_after_ms` is how long the server asked us to wait.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// HTTP 404 naming the model: the configured model id is not available
    /// for this API key.
    #[error("model `{model}` is not available for this API key")]
    ModelNotFound { model: String },

    /// Any other non-success status (401 bad key, 500 internal error, ...).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Underlying network failure (DNS, refused connection, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_name_the_cause() {
        let throttled = AnthropicError::RateLimited { retry_after_ms: 2000 };
        assert!(throttled.to_string().contains("2000ms"));

        let missing = AnthropicError::ModelNotFound {
            model: "claude-nope".into(),
        };
        assert_eq!(
            missing.to_string(),
            "model `claude-nope` is not available for this API key"
        );

        let server = AnthropicError::ApiError {
            status: 529,
            message: "overloaded".into(),
        };
        assert_eq!(server.to_string(), "API error (status 529): overloaded");
    }
}
