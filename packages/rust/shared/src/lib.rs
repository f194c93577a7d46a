//! Shared types, error model, and configuration for GrantHub.
//!
//! This crate is the foundation depended on by all other GrantHub crates.
//! It provides:
//! - [`GrantHubError`], the unified error type
//! - Domain types ([`CandidateRecord`], [`StoredRow`], [`KnowledgeEntry`], [`SyncStatus`])
//! - Cell normalization and the candidate schema validator
//! - Configuration ([`AppConfig`], credentials, config loading)
//! - The [`Clock`] abstraction used by every wait in the pipeline

pub mod cell;
pub mod clock;
pub mod config;
pub mod error;
pub mod schema;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use cell::{cell_text, collapse_text, first_non_empty};
pub use clock::{Clock, ManualClock, WallClock, sleep_or_cancel};
pub use config::{
    AppConfig, BackoffPolicy, ColumnNames, ConflictPolicy, Credentials, DiscoveryConfig,
    LlmConfig, MAX_CANDIDATE_CAP, PollerConfig, RetryConfig, ScheduleConfig, StoreBackend,
    StoreConfig, StoreCredentials, SyncConfig, UpsertConfig, clamp_sync_limit, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from,
    resolve_credentials, resolve_credentials_with,
};
pub use error::{GrantHubError, Result};
pub use schema::{is_valid_candidate, validate_candidate};
pub use types::{
    CandidateRecord, Columns, FAILED_TO_VERIFY, FinalPayload, KnowledgeEntry, MAX_STATUS_LEN,
    Row, RowId, RowUpdates, StoredRow, SyncStatus, is_sentinel, normalize_name, timestamp,
};
