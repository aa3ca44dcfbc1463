//! Error types for the contextloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; most of them are
//! recoverable and only degrade the quality of the assembled context.
//! The only failures a caller ever sees are [`ContextError::RetriesExhausted`],
//! [`ContextError::Cancelled`], [`ContextError::ChainExceedsBudget`] (when that
//! policy is selected) and permanent [`RequestError`]s.

use thiserror::Error;

/// The top-level error type for all contextloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Context assembly errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Language-model request errors ---
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    // --- Conversation store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Errors raised while assembling a context.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    /// Fixed overhead leaves no room for history, even at the smallest margin.
    #[error(
        "Base prompt ({base_prompt_tokens} tokens) + safety margin ({margin} tokens) exceed model limit ({limit} tokens)"
    )]
    BudgetExceeded {
        limit: usize,
        base_prompt_tokens: usize,
        margin: usize,
    },

    #[error("Malformed conversation: {0}")]
    MalformedConversation(String),

    #[error("Token counting strategy '{strategy}' unavailable: {reason}")]
    TokenCountingUnavailable { strategy: String, reason: String },

    #[error("Correlation over {items} items gave up after {elapsed_ms}ms, using recency-only clusters")]
    CorrelationTimeout { items: usize, elapsed_ms: u64 },

    /// Raised only under `ActiveChainPolicy::Fail`.
    #[error("Active tool chain {chain_id} needs {chain_tokens} tokens but only {available} are available")]
    ChainExceedsBudget {
        chain_id: String,
        chain_tokens: usize,
        available: usize,
    },

    #[error("Request failed after {attempts} attempts ({last_error}). {suggestion}")]
    RetriesExhausted {
        attempts: u32,
        last_error: String,
        suggestion: String,
    },

    #[error("Context assembly cancelled")]
    Cancelled,
}

/// Classified failures reported by the language-model client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider returned an empty response")]
    EmptyResponse,

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request rejected: {0}")]
    Validation(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Permanent provider failure: {0}")]
    Permanent(String),
}

impl RequestError {
    /// Whether the optimizer may retry this failure with a reduced context.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::EmptyResponse
                | Self::Timeout(_)
                | Self::Network(_)
                | Self::Overloaded(_)
        )
    }

    /// Stable label used to detect runs of the same failure.
    pub fn class(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::EmptyResponse => "empty_response",
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Overloaded(_) => "overloaded",
            Self::Authentication(_) => "authentication",
            Self::Validation(_) => "validation",
            Self::ModelNotFound(_) => "model_not_found",
            Self::Permanent(_) => "permanent",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Turn {turn_number} is not after the last stored turn {last}")]
    OutOfOrder { turn_number: u64, last: u64 },
}

/// Failure of a single token-counting strategy. Never escapes the
/// token accounting service.
#[derive(Debug, Clone, Error)]
pub enum TokenCountError {
    #[error("counting API unavailable: {0}")]
    Unavailable(String),

    #[error("tokenizer failed: {0}")]
    Tokenizer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RequestError::RateLimited { retry_after_secs: 3 }.is_transient());
        assert!(RequestError::EmptyResponse.is_transient());
        assert!(RequestError::Timeout("slow".into()).is_transient());
        assert!(!RequestError::Authentication("bad key".into()).is_transient());
        assert!(!RequestError::Validation("too long".into()).is_transient());
    }

    #[test]
    fn budget_error_displays_numbers() {
        let err = Error::Context(ContextError::BudgetExceeded {
            limit: 8000,
            base_prompt_tokens: 7990,
            margin: 50,
        });
        let msg = err.to_string();
        assert!(msg.contains("7990"));
        assert!(msg.contains("8000"));
    }

    #[test]
    fn retries_exhausted_carries_suggestion() {
        let err = ContextError::RetriesExhausted {
            attempts: 4,
            last_error: "rate limited".into(),
            suggestion: "Try a shorter request.".into(),
        };
        assert!(err.to_string().contains("shorter request"));
    }

    #[test]
    fn umbrella_wraps_each_bounded_context() {
        let err: Error = ContextError::Cancelled.into();
        assert!(matches!(err, Error::Context(ContextError::Cancelled)));

        let err: Error = RequestError::EmptyResponse.into();
        assert!(matches!(err, Error::Request(RequestError::EmptyResponse)));

        let err: Error = StoreError::SessionNotFound("s1".into()).into();
        assert!(err.to_string().starts_with("Store error"));
    }

    #[test]
    fn request_error_classes_are_stable() {
        assert_eq!(RequestError::EmptyResponse.class(), "empty_response");
        assert_eq!(
            RequestError::RateLimited { retry_after_secs: 1 }.class(),
            "rate_limited"
        );
    }
}
