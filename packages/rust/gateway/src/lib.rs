//! Language model gateway for GrantHub.
//!
//! A [`TextGenerator`] performs one text-generation request. The [`Gateway`]
//! wraps any generator with bounded exponential backoff on rate-limit
//! signals and is shared by discovery and verification. The gateway knows
//! nothing about grants.

mod client;
pub mod extract;
mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use granthub_shared::Result;

pub use client::{OpenRouterClient, OpenRouterOptions};
pub use extract::{Extraction, extract_array, extract_object, strip_code_fences};
pub use retry::Gateway;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Sampling parameters for one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl GenerationConfig {
    /// Broad sampling for producing a list of candidate names.
    pub const fn listing() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            max_tokens: 1024,
        }
    }

    /// Conservative sampling for one detailed record.
    pub const fn detail() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
        }
    }

    /// Near-deterministic sampling for claim checks and corrections.
    pub const fn verification() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 2048,
        }
    }
}

/// A prompt with an optional system instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            system: None,
            user: text.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TextGenerator
// ---------------------------------------------------------------------------

/// One language-model text-generation call.
///
/// Implementations fail with [`GrantHubError::RateLimited`] when the service
/// signals a rate limit and [`GrantHubError::RequestFailed`] otherwise. They
/// never retry on their own.
///
/// [`GrantHubError::RateLimited`]: granthub_shared::GrantHubError::RateLimited
/// [`GrantHubError::RequestFailed`]: granthub_shared::GrantHubError::RequestFailed
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &Prompt, config: &GenerationConfig) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_ordered_by_randomness() {
        assert!(GenerationConfig::listing().temperature > GenerationConfig::detail().temperature);
        assert!(
            GenerationConfig::detail().temperature > GenerationConfig::verification().temperature
        );
        assert_eq!(GenerationConfig::detail().max_tokens, 2048);
    }

    #[test]
    fn prompt_builder() {
        let prompt = Prompt::user("hello").with_system("be terse");
        assert_eq!(prompt.user, "hello");
        assert_eq!(prompt.system.as_deref(), Some("be terse"));
    }
}
