//! Candidate discovery for GrantHub.
//!
//! Discovery runs in two phases against the language model gateway:
//! 1. one request for a bounded list of grant names
//! 2. one request per name for the full record, validated against the
//!    candidate schema
//!
//! Detail requests are strictly sequential with a fixed delay between them,
//! so a shared rate limit is respected and log order is deterministic.

mod parser;
mod prompts;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use granthub_gateway::{Gateway, GenerationConfig};
use granthub_shared::{
    CandidateRecord, Clock, DiscoveryConfig, GrantHubError, Result, normalize_name,
    sleep_or_cancel,
};

pub use parser::{parse_candidate, parse_name_list};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Runtime settings for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Subject the name list is requested for.
    pub topic: String,
    /// Maximum number of names taken from the list response.
    pub cap: usize,
    /// Fixed pause between consecutive detail requests.
    pub request_delay: Duration,
    /// Skip names already in the store before their detail request.
    pub skip_existing: bool,
}

impl From<&DiscoveryConfig> for DiscoveryOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            cap: config.effective_cap(),
            request_delay: Duration::from_millis(config.request_delay_ms),
            skip_existing: config.skip_existing,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// A name whose detail request did not yield a usable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameFailure {
    pub name: String,
    pub reason: String,
}

/// Everything one discovery pass produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryOutcome {
    /// Names returned by the list phase, after dedup and cap.
    pub requested: Vec<String>,
    /// Valid records, in request order.
    #[serde(skip)]
    pub candidates: Vec<CandidateRecord>,
    /// Names skipped because the store already holds them.
    pub skipped_existing: Vec<String>,
    /// Names whose detail phase failed.
    pub failed: Vec<NameFailure>,
    /// Set when a stop request ended the pass early.
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// CandidateDiscovery
// ---------------------------------------------------------------------------

/// Produces validated candidate records through the gateway.
pub struct CandidateDiscovery {
    gateway: Gateway,
    clock: Arc<dyn Clock>,
    options: DiscoveryOptions,
}

impl CandidateDiscovery {
    pub fn new(gateway: Gateway, clock: Arc<dyn Clock>, options: DiscoveryOptions) -> Self {
        Self {
            gateway,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Run both phases.
    ///
    /// `existing` holds normalized names already present in the store. A
    /// failed list request is returned as an error; failures of single
    /// names are recorded in the outcome. A stop request lets the current
    /// detail request finish and returns the partial outcome.
    #[instrument(skip_all, fields(cap = self.options.cap))]
    pub async fn discover(
        &self,
        existing: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryOutcome> {
        let mut outcome = DiscoveryOutcome::default();
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let list_prompt = prompts::list_prompt(&self.options.topic, self.options.cap);
        let text = match self
            .gateway
            .generate(&list_prompt, &GenerationConfig::listing())
            .await
        {
            Ok(text) => text,
            Err(GrantHubError::Cancelled) => {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };
        outcome.requested = parse_name_list(&text, self.options.cap)?;
        info!(names = outcome.requested.len(), "candidate names received");

        let mut seen = HashSet::new();
        let mut issued = 0usize;

        for name in outcome.requested.clone() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            if self.options.skip_existing && existing.contains(&normalize_name(&name)) {
                info!(%name, "already in store, skipping");
                outcome.skipped_existing.push(name);
                continue;
            }

            if issued > 0
                && !sleep_or_cancel(self.clock.as_ref(), self.options.request_delay, cancel).await
            {
                outcome.cancelled = true;
                break;
            }
            issued += 1;

            match self.fetch_detail(&name).await {
                Ok(record) => {
                    if seen.insert(normalize_name(record.name())) {
                        debug!(%name, record = record.name(), "candidate accepted");
                        outcome.candidates.push(record);
                    } else {
                        warn!(%name, "duplicate record in this batch");
                        outcome.failed.push(NameFailure {
                            name,
                            reason: "duplicate of an earlier candidate".into(),
                        });
                    }
                }
                Err(GrantHubError::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(%name, error = %e, "candidate rejected");
                    outcome.failed.push(NameFailure {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            candidates = outcome.candidates.len(),
            skipped = outcome.skipped_existing.len(),
            failed = outcome.failed.len(),
            cancelled = outcome.cancelled,
            "discovery finished"
        );
        Ok(outcome)
    }

    async fn fetch_detail(&self, name: &str) -> Result<CandidateRecord> {
        let prompt = prompts::detail_prompt(&self.options.topic, name);
        let text = self
            .gateway
            .generate(&prompt, &GenerationConfig::detail())
            .await?;
        parse_candidate(&text)
    }
}
