//! Bounded retry with exponential backoff around a [`TextGenerator`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use granthub_shared::{BackoffPolicy, Clock, GrantHubError, Result, sleep_or_cancel};

use crate::{GenerationConfig, Prompt, TextGenerator};

/// Rate-limit aware front door to the language model service.
///
/// Rate-limit failures are retried after `base * 2^attempt` (capped) until
/// the attempt ceiling, then surfaced as [`GrantHubError::RateLimited`].
/// Every other failure is returned immediately. Cancellation only
/// interrupts backoff waits; a request already due is still sent.
#[derive(Clone)]
pub struct Gateway {
    generator: Arc<dyn TextGenerator>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        policy: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            generator,
            policy,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// Interrupt backoff waits when this token is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts))]
    pub async fn generate(&self, prompt: &Prompt, config: &GenerationConfig) -> Result<String> {
        let mut attempt: u32 = 0;
        loop {
            match self.generator.generate(prompt, config).await {
                Ok(text) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "generation succeeded after backoff");
                    }
                    return Ok(text);
                }
                Err(e) if e.is_rate_limited() => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        warn!(attempts = attempt, "rate limit persisted, giving up");
                        return Err(GrantHubError::RateLimited { attempts: attempt });
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        "rate limited, backing off"
                    );
                    if !sleep_or_cancel(self.clock.as_ref(), delay, &self.cancel).await {
                        return Err(GrantHubError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
