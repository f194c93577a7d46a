//! End-to-end pipeline run: discover → upsert → verify → poll → sync.
//!
//! Stages hand each other row identifiers only. A failing stage is recorded
//! in the [`RunSummary`] and the run moves on; knowledge sync is always
//! attempted because its own selection skips rows that are not ready.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use granthub_discovery::{CandidateDiscovery, DiscoveryOptions, NameFailure};
use granthub_gateway::{Gateway, TextGenerator};
use granthub_shared::{
    AppConfig, BackoffPolicy, Clock, GrantHubError, MAX_CANDIDATE_CAP, Result, RowId, timestamp,
};
use granthub_storage::Stores;

use crate::knowledge::{KnowledgeSync, SyncSummary};
use crate::poller::DecisionPoller;
use crate::upsert::UpsertEngine;
use crate::verification::{VerificationSummary, Verifier, VerifyTarget};

// ---------------------------------------------------------------------------
// State, options, summary
// ---------------------------------------------------------------------------

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Discovering,
    Upserting,
    Verifying,
    Polling,
    Syncing,
}

impl PipelineState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Discovering => "Discovering candidates",
            Self::Upserting => "Upserting candidates",
            Self::Verifying => "Verifying rows",
            Self::Polling => "Waiting for decisions",
            Self::Syncing => "Syncing knowledge",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-run overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Candidate cap for discovery (clamped to the hard ceiling).
    pub candidate_cap: Option<usize>,
    /// Row limit for knowledge sync.
    pub sync_limit: Option<usize>,
}

/// Outcome of one pipeline run. Built once and never changed afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    /// Candidate names returned by the list phase.
    pub requested: usize,
    /// Valid records produced by discovery.
    pub scraped: usize,
    pub added: usize,
    pub updated: usize,
    /// Names skipped as already stored plus candidates dropped by upsert.
    pub skipped: usize,
    /// Names whose detail phase failed plus rows whose verification failed.
    pub failed: usize,
    pub skipped_existing: Vec<String>,
    pub failed_names: Vec<NameFailure>,
    /// Rows inserted by this run.
    pub row_ids: Vec<RowId>,
    pub verification: Option<VerificationSummary>,
    pub decisions: BTreeMap<RowId, String>,
    pub unresolved: Vec<RowId>,
    pub sync: Option<SyncSummary>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, state: PipelineState);
    /// Called when a stage finishes, with a one-line result.
    fn stage_done(&self, state: PipelineState, detail: &str);
    /// Called once with the final summary.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _state: PipelineState) {}
    fn stage_done(&self, _state: PipelineState, _detail: &str) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Collaborators injected into the pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub stores: Stores,
    /// Generator used for candidate discovery.
    pub discovery_generator: Arc<dyn TextGenerator>,
    /// Generator used for claim checks and final correction.
    pub verification_generator: Arc<dyn TextGenerator>,
    pub clock: Arc<dyn Clock>,
}

pub struct Pipeline {
    config: AppConfig,
    stores: Stores,
    clock: Arc<dyn Clock>,
    discovery_gateway: Gateway,
    verification_gateway: Gateway,
    state: PipelineState,
}

impl Pipeline {
    /// Build a pipeline whose gateways stop backing off once `cancel` fires.
    pub fn new(config: &AppConfig, deps: PipelineDeps, cancel: &CancellationToken) -> Self {
        let policy = BackoffPolicy::from(&config.retry);
        let gateway = |generator| {
            Gateway::new(generator, policy, deps.clock.clone()).with_cancellation(cancel.clone())
        };
        Self {
            config: config.clone(),
            discovery_gateway: gateway(deps.discovery_generator.clone()),
            verification_gateway: gateway(deps.verification_generator.clone()),
            stores: deps.stores,
            clock: deps.clock,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn enter(&mut self, state: PipelineState, progress: &dyn ProgressReporter) {
        info!(from = ?self.state, to = ?state, "pipeline stage");
        self.state = state;
        if state != PipelineState::Idle {
            progress.phase(state);
        }
    }

    fn upsert_engine(&self) -> UpsertEngine {
        UpsertEngine::new(
            self.stores.tables.clone(),
            &self.config.store,
            self.config.upsert.on_conflict,
        )
    }

    fn verifier(&self) -> Verifier {
        Verifier::new(
            self.verification_gateway.clone(),
            self.stores.tables.clone(),
            &self.config.store,
        )
    }

    fn knowledge_sync(&self) -> KnowledgeSync {
        KnowledgeSync::new(
            self.stores.tables.clone(),
            self.stores.knowledge.clone(),
            &self.config.store,
        )
    }

    /// Run every stage once and return the summary.
    ///
    /// Never fails: stage errors land in `RunSummary::errors`. A stop request
    /// lets the current candidate or row finish, skips the remaining stages
    /// and still returns the partial summary.
    #[instrument(skip_all)]
    pub async fn run(
        &mut self,
        options: RunOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> RunSummary {
        let mut summary = RunSummary {
            started_at: timestamp(Utc::now()),
            ..RunSummary::default()
        };
        info!(started_at = %summary.started_at, "pipeline run started");

        let row_ids = self.discover_and_upsert(options, cancel, progress, &mut summary).await;
        summary.row_ids = row_ids.clone();

        let mut finalized = Vec::new();
        if !summary.cancelled && !row_ids.is_empty() {
            self.enter(PipelineState::Verifying, progress);
            match self.verifier().verify(VerifyTarget::Rows(row_ids), cancel).await {
                Ok(verification) => {
                    progress.stage_done(
                        PipelineState::Verifying,
                        &format!(
                            "{} verified, {} failed to verify, {} failed",
                            verification.finalized.len(),
                            verification.sentinel,
                            verification.failed
                        ),
                    );
                    summary.failed += verification.failed;
                    summary.errors.extend(verification.errors.iter().cloned());
                    summary.cancelled |= verification.cancelled;
                    finalized = verification.finalized.clone();
                    summary.verification = Some(verification);
                }
                Err(e) => stage_error(&mut summary, "verification", &e),
            }
        }

        if !summary.cancelled && !finalized.is_empty() {
            self.enter(PipelineState::Polling, progress);
            let poller = DecisionPoller::new(
                self.stores.tables.clone(),
                self.clock.clone(),
                &self.config.store,
                &self.config.poller,
            );
            match poller.wait_for_decisions(&finalized, cancel).await {
                Ok(outcome) => {
                    progress.stage_done(
                        PipelineState::Polling,
                        &format!(
                            "{} decided, {} unresolved",
                            outcome.decisions.len(),
                            outcome.unresolved.len()
                        ),
                    );
                    summary.errors.extend(outcome.errors);
                    summary.cancelled |= outcome.cancelled;
                    summary.decisions = outcome.decisions;
                    summary.unresolved = outcome.unresolved;
                }
                Err(e) => stage_error(&mut summary, "decision polling", &e),
            }
        }

        if !summary.cancelled {
            self.enter(PipelineState::Syncing, progress);
            let limit = options.sync_limit.unwrap_or(self.config.sync.limit);
            match self.knowledge_sync().sync(limit).await {
                Ok(sync) => {
                    progress.stage_done(
                        PipelineState::Syncing,
                        &format!(
                            "{} synced, {} skipped, {} failed",
                            sync.synced, sync.skipped, sync.failed
                        ),
                    );
                    summary.errors.extend(sync.errors.iter().cloned());
                    summary.sync = Some(sync);
                }
                Err(e) => stage_error(&mut summary, "knowledge sync", &e),
            }
        }

        self.enter(PipelineState::Idle, progress);
        summary.finished_at = timestamp(Utc::now());
        info!(
            requested = summary.requested,
            scraped = summary.scraped,
            added = summary.added,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            errors = summary.errors.len(),
            cancelled = summary.cancelled,
            "pipeline run finished"
        );
        progress.done(&summary);
        summary
    }

    /// Discovery and upsert; returns the inserted row ids.
    async fn discover_and_upsert(
        &mut self,
        options: RunOptions,
        cancel: &CancellationToken,
        progress: &dyn ProgressReporter,
        summary: &mut RunSummary,
    ) -> Vec<RowId> {
        self.enter(PipelineState::Discovering, progress);
        let upsert = self.upsert_engine();

        let existing: HashSet<String> = match upsert.existing_names().await {
            Ok(names) => names,
            Err(e) => {
                stage_error(summary, "discovery", &e);
                return Vec::new();
            }
        };

        let mut discovery_options = DiscoveryOptions::from(&self.config.discovery);
        if let Some(cap) = options.candidate_cap {
            discovery_options.cap = cap.clamp(1, MAX_CANDIDATE_CAP);
        }
        let discovery = CandidateDiscovery::new(
            self.discovery_gateway.clone(),
            self.clock.clone(),
            discovery_options,
        );

        let outcome = match discovery.discover(&existing, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                stage_error(summary, "discovery", &e);
                return Vec::new();
            }
        };
        progress.stage_done(
            PipelineState::Discovering,
            &format!(
                "{} names, {} valid, {} already stored, {} failed",
                outcome.requested.len(),
                outcome.candidates.len(),
                outcome.skipped_existing.len(),
                outcome.failed.len()
            ),
        );
        summary.requested = outcome.requested.len();
        summary.scraped = outcome.candidates.len();
        summary.skipped += outcome.skipped_existing.len();
        summary.failed += outcome.failed.len();
        summary.errors.extend(
            outcome
                .failed
                .iter()
                .map(|f| format!("discovery: {}: {}", f.name, f.reason)),
        );
        summary.skipped_existing = outcome.skipped_existing;
        summary.failed_names = outcome.failed;
        summary.cancelled = outcome.cancelled;

        if outcome.candidates.is_empty() {
            return Vec::new();
        }

        // Candidates already fetched are persisted even after a stop request.
        self.enter(PipelineState::Upserting, progress);
        match upsert.upsert(&outcome.candidates, Utc::now()).await {
            Ok(result) => {
                progress.stage_done(
                    PipelineState::Upserting,
                    &format!("{} added, {} updated", result.added, result.updated),
                );
                summary.added = result.added;
                summary.updated = result.updated;
                summary.skipped += result.skipped;
                result.row_ids
            }
            Err(e) => {
                stage_error(summary, "upsert", &e);
                Vec::new()
            }
        }
    }

    /// Catch-up verification of rows that have no final payload yet.
    pub async fn verify_pending(
        &self,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<VerificationSummary> {
        self.verifier()
            .verify(VerifyTarget::MissingFinal { limit }, cancel)
            .await
    }

    /// Knowledge sync on its own.
    pub async fn sync_only(&self, limit: Option<usize>) -> Result<SyncSummary> {
        self.knowledge_sync()
            .sync(limit.unwrap_or(self.config.sync.limit))
            .await
    }
}

fn stage_error(summary: &mut RunSummary, stage: &str, error: &GrantHubError) {
    warn!(stage, error = %error, "stage failed");
    if matches!(error, GrantHubError::Cancelled) {
        summary.cancelled = true;
        return;
    }
    summary.errors.push(format!("{stage}: {error}"));
}
