//! Application configuration for GrantHub.
//!
//! User config lives at `~/.granthub/granthub.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets never live in the file: it only names the environment variables
//! that hold them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GrantHubError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "granthub.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".granthub";

/// Upper bound on the number of candidate names requested per run.
pub const MAX_CANDIDATE_CAP: usize = 25;

/// Bounds applied to the knowledge sync row limit.
pub const SYNC_LIMIT_RANGE: (usize, usize) = (1, 100);

// ---------------------------------------------------------------------------
// Config structs (matching granthub.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Language model service settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Rate-limit retry policy for the gateway.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Structured table store and knowledge store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Candidate discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Conflict policy for re-discovered candidates.
    #[serde(default)]
    pub upsert: UpsertConfig,

    /// Decision poller settings.
    #[serde(default)]
    pub poller: PollerConfig,

    /// Knowledge sync settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Daily worker schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible chat completions API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model used for discovery.
    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for verification; falls back to `model` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_model: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_llm_api_key_env(),
            base_url: default_llm_base_url(),
            model: default_model(),
            verification_model: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    /// The model the verification pass should use.
    pub fn verification_model(&self) -> &str {
        self.verification_model.as_deref().unwrap_or(&self.model)
    }
}

fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_llm_timeout() -> u64 {
    120
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base backoff delay in seconds; attempt `n` waits `base * 2^n`.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    /// Cap on a single backoff delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Total attempts before a rate limit is surfaced to the caller.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay() -> u64 {
    15
}
fn default_max_delay() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    4
}

/// Which implementation backs the structured and knowledge stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Hosted table product reached over its REST API.
    #[default]
    Jamai,
    /// Local libSQL database file.
    Local,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend implementation.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Base URL of the hosted table API.
    #[serde(default = "default_store_base_url")]
    pub base_url: String,

    /// Name of the env var holding the hosted project id.
    #[serde(default = "default_project_id_env")]
    pub project_id_env: String,

    /// Name of the env var holding the hosted API key.
    #[serde(default = "default_store_api_key_env")]
    pub api_key_env: String,

    /// Table holding drafts, verdicts, final payloads and decisions.
    #[serde(default = "default_action_table")]
    pub action_table_id: String,

    /// Table receiving knowledge entries.
    #[serde(default = "default_knowledge_table")]
    pub knowledge_table_id: String,

    /// Database file for the local backend (`~` is expanded).
    #[serde(default = "default_local_path")]
    pub local_path: String,

    /// Decision value that approves a row for knowledge sync.
    #[serde(default = "default_approved_token")]
    pub approved_token: String,

    /// Column names in the action table.
    #[serde(default)]
    pub columns: ColumnNames,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            base_url: default_store_base_url(),
            project_id_env: default_project_id_env(),
            api_key_env: default_store_api_key_env(),
            action_table_id: default_action_table(),
            knowledge_table_id: default_knowledge_table(),
            local_path: default_local_path(),
            approved_token: default_approved_token(),
            columns: ColumnNames::default(),
        }
    }
}

fn default_store_base_url() -> String {
    "https://api.jamaibase.com".into()
}
fn default_project_id_env() -> String {
    "JAMAI_PROJECT_ID".into()
}
fn default_store_api_key_env() -> String {
    "JAMAI_API_KEY".into()
}
fn default_action_table() -> String {
    "scrap_result".into()
}
fn default_knowledge_table() -> String {
    "grants".into()
}
fn default_local_path() -> String {
    "~/.granthub/granthub.db".into()
}
fn default_approved_token() -> String {
    "proceed to knowledge table sync".into()
}

/// `[store.columns]` section. Column names are configuration, not protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNames {
    /// Unverified candidate payload.
    #[serde(default = "default_draft_col")]
    pub draft: String,
    /// Per-field verdicts.
    #[serde(default = "default_verified_col")]
    pub verified: String,
    /// Corrected payload or the sentinel.
    #[serde(default = "default_final_col")]
    pub final_payload: String,
    /// Externally computed approval decision.
    #[serde(default = "default_decision_col")]
    pub decision: String,
    /// Knowledge sync status.
    #[serde(default = "default_sync_status_col")]
    pub sync_status: String,
    /// Last-modified timestamp written on insert.
    #[serde(default = "default_updated_at_col")]
    pub updated_at: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            draft: default_draft_col(),
            verified: default_verified_col(),
            final_payload: default_final_col(),
            decision: default_decision_col(),
            sync_status: default_sync_status_col(),
            updated_at: default_updated_at_col(),
        }
    }
}

fn default_draft_col() -> String {
    "grant_scrap".into()
}
fn default_verified_col() -> String {
    "grant_verified".into()
}
fn default_final_col() -> String {
    "grant_final".into()
}
fn default_decision_col() -> String {
    "grant_decider".into()
}
fn default_sync_status_col() -> String {
    "knowledge_sync_status".into()
}
fn default_updated_at_col() -> String {
    "updated_at".into()
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Subject the generator is asked to list grants for.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Maximum candidate names requested per run (clamped to [`MAX_CANDIDATE_CAP`]).
    #[serde(default = "default_candidate_cap")]
    pub candidate_cap: usize,

    /// Fixed delay between per-name detail requests, in milliseconds.
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    /// Skip names already present in the store before the detail call.
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            candidate_cap: default_candidate_cap(),
            request_delay_ms: default_request_delay(),
            skip_existing: true,
        }
    }
}

fn default_topic() -> String {
    "Malaysian government grants for small and medium enterprises".into()
}
fn default_candidate_cap() -> usize {
    10
}
fn default_request_delay() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

/// What to do when a candidate's normalized name matches an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Delete the old row and insert the new record in its place.
    #[default]
    Replace,
    /// Keep the old row and drop the new record.
    Skip,
}

/// `[upsert]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertConfig {
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

/// `[poller]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Seconds between polls of pending rows.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Global timeout for one polling session, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    15
}
fn default_poll_timeout() -> u64 {
    180
}

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Default number of rows selected per sync run.
    #[serde(default = "default_sync_limit")]
    pub limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            limit: default_sync_limit(),
        }
    }
}

fn default_sync_limit() -> usize {
    20
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Local hour (0-23) of the daily run.
    #[serde(default = "default_hour")]
    pub hour: u32,
    /// Local minute (0-59) of the daily run.
    #[serde(default = "default_minute")]
    pub minute: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hour: default_hour(),
            minute: default_minute(),
        }
    }
}

fn default_hour() -> u32 {
    3
}
fn default_minute() -> u32 {
    30
}

// ---------------------------------------------------------------------------
// Runtime policies derived from config
// ---------------------------------------------------------------------------

/// Backoff policy for rate-limited generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_delay_secs),
            cap: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl DiscoveryConfig {
    /// Candidate cap after clamping to the hard ceiling.
    pub fn effective_cap(&self) -> usize {
        self.candidate_cap.clamp(1, MAX_CANDIDATE_CAP)
    }
}

/// Clamp a requested sync limit into [`SYNC_LIMIT_RANGE`].
pub fn clamp_sync_limit(limit: usize) -> usize {
    limit.clamp(SYNC_LIMIT_RANGE.0, SYNC_LIMIT_RANGE.1)
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Secrets resolved from the environment at startup.
#[derive(Clone)]
pub struct Credentials {
    /// Language model API key.
    pub llm_api_key: String,
    /// Hosted store credentials (absent for the local backend).
    pub store: Option<StoreCredentials>,
}

/// Hosted table store credentials.
#[derive(Clone)]
pub struct StoreCredentials {
    pub project_id: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("llm_api_key", &"<redacted>")
            .field("store", &self.store.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolve every secret the pipeline needs from the process environment.
pub fn resolve_credentials(config: &AppConfig) -> Result<Credentials> {
    resolve_credentials_with(config, |name| std::env::var(name).ok())
}

/// Resolve credentials through an arbitrary variable lookup.
///
/// Every missing value is collected so the error names all of them at once.
pub fn resolve_credentials_with(
    config: &AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credentials> {
    let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut missing: Vec<String> = Vec::new();

    let llm_api_key = non_empty(&config.llm.api_key_env);
    if llm_api_key.is_none() {
        missing.push(config.llm.api_key_env.clone());
    }
    if config.store.action_table_id.trim().is_empty() {
        missing.push("store.action_table_id".into());
    }
    if config.store.knowledge_table_id.trim().is_empty() {
        missing.push("store.knowledge_table_id".into());
    }

    let mut store = None;
    if config.store.backend == StoreBackend::Jamai {
        if config.store.base_url.trim().is_empty() {
            missing.push("store.base_url".into());
        }
        let project_id = non_empty(&config.store.project_id_env);
        let api_key = non_empty(&config.store.api_key_env);
        if project_id.is_none() {
            missing.push(config.store.project_id_env.clone());
        }
        if api_key.is_none() {
            missing.push(config.store.api_key_env.clone());
        }
        if let (Some(project_id), Some(api_key)) = (project_id, api_key) {
            store = Some(StoreCredentials {
                project_id,
                api_key,
            });
        }
    }

    match llm_api_key {
        Some(llm_api_key) if missing.is_empty() => Ok(Credentials { llm_api_key, store }),
        _ => Err(GrantHubError::config(format!(
            "missing configuration values: {}",
            missing.join(", ")
        ))),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.granthub/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| GrantHubError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.granthub/granthub.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| GrantHubError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| GrantHubError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| GrantHubError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| GrantHubError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| GrantHubError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| GrantHubError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
