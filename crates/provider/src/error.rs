#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    HttpError { status: u16, body: String },

    #[error("Rate limited. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

const MISMATCH_MARKERS: &[&str] = &[
    "unsupported parameter",
    "unsupported value",
    "is not supported",
    "does not support",
    "role=function",
    "not allowed",
    "unknown parameter",
];

impl ProviderError {
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        match status {
            429 => {
                let retry_after_ms = retry_after
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(2_000);
                ProviderError::RateLimited { retry_after_ms }
            }
            401 | 403 => ProviderError::Credentials(body),
            400 | 404 | 422 if looks_like_capability_mismatch(&body) => {
                ProviderError::CapabilityMismatch(body)
            }
            _ => ProviderError::HttpError { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Timeout(_) => true,
            ProviderError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub fn is_capability_mismatch(&self) -> bool {
        matches!(self, ProviderError::CapabilityMismatch(_))
    }
}

/// Provider error bodies are free-form; recognize the phrasings the major
/// APIs use when a parameter or role is outside the model's capability.
pub fn looks_like_capability_mismatch(text: &str) -> bool {
    let lower = text.to_lowercase();
    MISMATCH_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_parses_retry_after() {
        let err = ProviderError::from_http(429, "slow down".into(), Some("7"));
        assert_eq!(err.retry_after_ms(), Some(7_000));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ProviderError::from_http(503, "overloaded".into(), None);
        assert!(err.is_retryable());
    }

    #[test]
    fn unsupported_parameter_is_capability_mismatch() {
        let err = ProviderError::from_http(
            400,
            "Unsupported parameter: 'stop' is not supported with this model.".into(),
            None,
        );
        assert!(err.is_capability_mismatch());
        assert!(!err.is_retryable());
    }

    #[test]
    fn auth_failure_is_credentials() {
        let err = ProviderError::from_http(401, "invalid api key".into(), None);
        assert!(matches!(err, ProviderError::Credentials(_)));
    }

    #[test]
    fn mismatch_marker_scan() {
        assert!(looks_like_capability_mismatch("role=function not allowed"));
        assert!(!looks_like_capability_mismatch("internal server error"));
    }
}
