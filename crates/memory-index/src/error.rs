use thiserror::Error;

/// Error kinds callers may need to tell apart. Everything else travels as
/// `anyhow::Error` with context, and classification happens on the message.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("missing API key for {provider}: {hint}")]
    MissingApiKey {
        provider: &'static str,
        hint: String,
    },

    #[error("local embedding setup failed:\n{0}")]
    ProviderSetup(String),

    #[error("no embedding provider available: {0}")]
    NoProvider(String),

    #[error("provider batch endpoint not available: {0}")]
    BatchUnavailable(String),

    #[error("path not allowed: {0}")]
    PathDenied(String),

    #[error("store swap failed: {0}")]
    SwapFailure(String),
}

pub(crate) fn is_missing_key(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<MemoryError>(),
        Some(MemoryError::MissingApiKey { .. })
    )
}

pub(crate) fn is_batch_unavailable(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<MemoryError>(),
        Some(MemoryError::BatchUnavailable(_))
    )
}

/// Transient provider failures worth another attempt.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    const MARKERS: &[&str] = &[
        "rate limit",
        "rate_limit",
        "too many requests",
        "429",
        "resource exhausted",
        "500",
        "502",
        "503",
        "504",
        "5xx",
        "cloudflare",
    ];
    MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Errors that justify switching to the fallback provider mid-sync.
pub(crate) fn is_embedding_failure_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("embedding") || lower.contains("batch")
}

#[cfg(test)]
mod tests {
    use super::{is_embedding_failure_message, is_retryable_message};

    #[test]
    fn retryable_matches_rate_limit_and_server_errors() {
        assert!(is_retryable_message("HTTP 429 Too Many Requests"));
        assert!(is_retryable_message("resource exhausted"));
        assert!(is_retryable_message("upstream returned 503"));
        assert!(is_retryable_message("Cloudflare tunnel error"));
        assert!(!is_retryable_message("invalid api key"));
    }

    #[test]
    fn fallback_eligibility_matches_embedding_and_batch_failures() {
        assert!(is_embedding_failure_message("embeddings rate limited"));
        assert!(is_embedding_failure_message("Batch job failed"));
        assert!(!is_embedding_failure_message("disk full"));
    }
}
