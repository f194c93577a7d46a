//! Core pipeline orchestration and domain logic for GrantHub.
//!
//! This crate ties together candidate discovery, upsert, verification,
//! decision polling and knowledge sync into one end-to-end run.

pub mod knowledge;
pub mod pipeline;
pub mod poller;
mod prompts;
pub mod schedule;
pub mod upsert;
pub mod verification;

#[cfg(test)]
mod test_support;

pub use knowledge::{KnowledgeSync, SyncSummary, map_to_knowledge};
pub use pipeline::{
    Pipeline, PipelineDeps, PipelineState, ProgressReporter, RunOptions, RunSummary,
    SilentProgress,
};
pub use poller::{DecisionPoller, PollOutcome, PollState};
pub use schedule::{DailySchedule, wait_in_chunks};
pub use upsert::{UpsertEngine, UpsertOutcome};
pub use verification::{Accuracy, VerificationSummary, Verifier, Verdict, VerifyTarget};
