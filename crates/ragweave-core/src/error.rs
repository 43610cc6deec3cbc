//! Error taxonomy shared by every ragweave component.
//!
//! | Variant | Raised by | Handling |
//! |---------|-----------|----------|
//! | [`Error::Config`] | config validation, `rebuild()` | fatal; previous config stays active |
//! | [`Error::Provider`] | embedding, rerank, loader calls | retried at batch granularity when retryable |
//! | [`Error::Store`] | vector/document/cache backends | batch rollback during ingest |
//! | [`Error::CacheInconsistency`] | fingerprint verification | treated as a cache miss |
//! | [`Error::Timeout`] | any bounded provider/store call | retryable |
//! | [`Error::InvalidRequest`] | query validation | surfaced to the caller |

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("provider '{provider}' failed: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
    },

    #[error("{backend} store error: {message}")]
    Store { backend: String, message: String },

    #[error("fingerprint {key} references {missing} node(s) missing from the stores")]
    CacheInconsistency { key: String, missing: usize },

    #[error("{operation} timed out after {ms}ms")]
    Timeout { operation: String, ms: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// A transient provider failure (network error, 429, 5xx).
    pub fn provider(provider: impl Into<String>, message: impl ToString) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.to_string(),
            retryable: true,
        }
    }

    /// A provider failure that will not go away on retry (4xx, bad payload).
    pub fn provider_fatal(provider: impl Into<String>, message: impl ToString) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.to_string(),
            retryable: false,
        }
    }

    pub fn store(backend: impl Into<String>, message: impl ToString) -> Self {
        Error::Store {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    /// Whether a batch that failed with this error may be rolled back and retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Provider {
                retryable: true,
                ..
            } | Error::Timeout { .. }
        )
    }

    /// Stable machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG",
            Error::Provider { .. } => "PROVIDER",
            Error::Store { .. } => "STORE",
            Error::CacheInconsistency { .. } => "CACHE_INCONSISTENCY",
            Error::Timeout { .. } => "TIMEOUT",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Io(_) => "IO",
            Error::Other(_) => "INTERNAL",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::provider("openai", "HTTP 503").is_retryable());
        assert!(!Error::provider_fatal("openai", "HTTP 400").is_retryable());
        assert!(Error::Timeout {
            operation: "embed".into(),
            ms: 10
        }
        .is_retryable());
        assert!(!Error::store("sqlite", "locked").is_retryable());
        assert!(!Error::config("bad").is_retryable());
    }

    #[test]
    fn test_codes_and_display() {
        let e = Error::CacheInconsistency {
            key: "kb/text/x/abc".into(),
            missing: 2,
        };
        assert_eq!(e.code(), "CACHE_INCONSISTENCY");
        assert!(e.to_string().contains("2 node(s)"));
        assert_eq!(
            Error::store("memory", "boom").to_string(),
            "memory store error: boom"
        );
    }
}
