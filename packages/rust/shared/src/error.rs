//! Error types for GrantHub.
//!
//! Library crates use [`GrantHubError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all GrantHub operations.
#[derive(Debug, thiserror::Error)]
pub enum GrantHubError {
    /// Required configuration or credentials are missing. Fails the whole run.
    #[error("config error: {message}")]
    Config { message: String },

    /// The language model service kept signalling a rate limit.
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited { attempts: u32 },

    /// The language model service rejected or failed a request.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Model output could not be turned into the expected structure.
    #[error("malformed output: {message}")]
    MalformedOutput { message: String },

    /// Reading from the structured store failed.
    #[error("store read failed: {0}")]
    StoreRead(String),

    /// Writing to the structured or knowledge store failed.
    #[error("store write failed: {0}")]
    StoreWrite(String),

    /// Data validation error (schema mismatch, invalid value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A graceful-stop request interrupted a wait.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GrantHubError>;

impl GrantHubError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a malformed-output error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a (possibly exhausted) rate-limit signal.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = GrantHubError::config("missing GRANTHUB_LLM_API_KEY");
        assert_eq!(err.to_string(), "config error: missing GRANTHUB_LLM_API_KEY");

        let err = GrantHubError::RateLimited { attempts: 4 };
        assert_eq!(err.to_string(), "rate limited after 4 attempt(s)");

        let err = GrantHubError::malformed("no JSON object found");
        assert!(err.to_string().contains("no JSON object"));
    }

    #[test]
    fn rate_limited_predicate() {
        assert!(GrantHubError::RateLimited { attempts: 1 }.is_rate_limited());
        assert!(!GrantHubError::RequestFailed("boom".into()).is_rate_limited());
    }
}
