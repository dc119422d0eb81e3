//! Application configuration for the intelligence hub.
//!
//! User config lives at `~/.intelhub/intelhub.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IntelHubError, Result};
use crate::types::Credential;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "intelhub.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".intelhub";

// ---------------------------------------------------------------------------
// Config structs (matching intelhub.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline and worker settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// AI provider endpoints.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Account pool and balance monitoring.
    #[serde(default)]
    pub accounts: AccountsConfig,

    /// Structured-output schema bounds.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Read surface defaults.
    #[serde(default)]
    pub read: ReadConfig,

    /// Registered collectors.
    #[serde(default)]
    pub collectors: Vec<CollectorEntry>,
}

/// `[hub]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Number of concurrent analysis workers.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Lease duration granted on claim.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// How often expired leases are swept back to CACHED.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    /// Initial idle backoff when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling for the idle backoff.
    #[serde(default = "default_max_poll_backoff_ms")]
    pub max_poll_backoff_ms: u64,
    /// Wait between account selection attempts while saturated.
    #[serde(default = "default_saturation_backoff_ms")]
    pub saturation_backoff_ms: u64,
    /// How long a worker keeps renewing its lease while saturated.
    #[serde(default = "default_saturation_patience_secs")]
    pub saturation_patience_secs: u64,
    /// Transient attempts allowed before an item is discarded.
    #[serde(default = "default_retry_cap")]
    pub transient_retry_cap: u32,
    /// Format attempts allowed before an item is discarded.
    #[serde(default = "default_retry_cap")]
    pub format_retry_cap: u32,
    /// Base delay of the transient retry backoff.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Ceiling of the transient retry backoff.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// How often registered collectors are polled.
    #[serde(default = "default_collect_interval_secs")]
    pub collect_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            workers: default_workers(),
            lease_secs: default_lease_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_backoff_ms: default_max_poll_backoff_ms(),
            saturation_backoff_ms: default_saturation_backoff_ms(),
            saturation_patience_secs: default_saturation_patience_secs(),
            transient_retry_cap: default_retry_cap(),
            format_retry_cap: default_retry_cap(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            collect_interval_secs: default_collect_interval_secs(),
        }
    }
}

fn default_database_path() -> String {
    "~/.intelhub/intelhub.db".into()
}
fn default_workers() -> u32 {
    4
}
fn default_lease_secs() -> u64 {
    300
}
fn default_reclaim_interval_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_poll_backoff_ms() -> u64 {
    10_000
}
fn default_saturation_backoff_ms() -> u64 {
    1_000
}
fn default_saturation_patience_secs() -> u64 {
    120
}
fn default_retry_cap() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}
fn default_retry_max_delay_ms() -> u64 {
    60_000
}
fn default_collect_interval_secs() -> u64 {
    600
}

/// `[provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible API base URL (without `/v1`).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model used for analysis.
    #[serde(default = "default_model")]
    pub model: String,
    /// Balance query endpoint.
    #[serde(default = "default_balance_url")]
    pub balance_url: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional file overriding the built-in analysis prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            balance_url: default_balance_url(),
            request_timeout_secs: default_request_timeout_secs(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            prompt_file: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.siliconflow.cn".into()
}
fn default_model() -> String {
    "Qwen/Qwen3-235B-A22B".into()
}
fn default_balance_url() -> String {
    "https://api.siliconflow.cn/v1/user/info".into()
}
fn default_request_timeout_secs() -> u64 {
    240
}
fn default_max_tokens() -> u32 {
    5_000
}

/// `[accounts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    /// Below this balance an account is LOW_BALANCE.
    #[serde(default = "default_low_balance_threshold")]
    pub low_balance_threshold: f64,
    /// Below this balance an account is EXHAUSTED.
    #[serde(default = "default_exhausted_floor")]
    pub exhausted_floor: f64,
    /// Concurrent in-flight calls allowed per account.
    #[serde(default = "default_per_account_concurrency")]
    pub per_account_concurrency: u32,
    /// Balance refresh interval.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Balance refresh interval while any account is LOW_BALANCE.
    #[serde(default = "default_low_balance_interval_secs")]
    pub low_balance_interval_secs: u64,
    /// Per-account balance query timeout.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Optional file with one credential per line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_file: Option<String>,
    /// Credentials referenced by environment variable.
    #[serde(default)]
    pub keys: Vec<AccountKeyEntry>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            low_balance_threshold: default_low_balance_threshold(),
            exhausted_floor: default_exhausted_floor(),
            per_account_concurrency: default_per_account_concurrency(),
            monitor_interval_secs: default_monitor_interval_secs(),
            low_balance_interval_secs: default_low_balance_interval_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            keys_file: None,
            keys: Vec::new(),
        }
    }
}

fn default_low_balance_threshold() -> f64 {
    1.0
}
fn default_exhausted_floor() -> f64 {
    0.2
}
fn default_per_account_concurrency() -> u32 {
    2
}
fn default_monitor_interval_secs() -> u64 {
    600
}
fn default_low_balance_interval_secs() -> u64 {
    60
}
fn default_query_timeout_secs() -> u64 {
    10
}

/// `[[accounts.keys]]` entry. The secret itself never lives in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountKeyEntry {
    /// Stable account identifier.
    pub id: String,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
    /// Balance assumed until the first refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_balance_hint: Option<f64>,
}

/// `[validation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub score_min: f64,
    #[serde(default = "default_score_max")]
    pub score_max: f64,
    /// Allowed classification labels (exact match).
    #[serde(default = "default_classifications")]
    pub classifications: Vec<String>,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            score_min: 0.0,
            score_max: default_score_max(),
            classifications: default_classifications(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_score_max() -> f64 {
    10.0
}
fn default_classifications() -> Vec<String> {
    [
        "politics",
        "economy",
        "military",
        "technology",
        "society",
        "security",
        "health",
        "environment",
        "other",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_summary_max_chars() -> usize {
    2_000
}

/// `[read]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    #[serde(default = "default_score_threshold")]
    pub default_score_threshold: f64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            default_score_threshold: default_score_threshold(),
        }
    }
}

fn default_score_threshold() -> f64 {
    6.0
}

/// `[[collectors]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorEntry {
    /// Unique collector name (also the documents' `source_name`).
    pub name: String,
    /// Collector variant.
    pub kind: CollectorKind,
    /// Feed or page URLs.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Built-in collector variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Rss,
    Page,
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub lease: Duration,
    pub reclaim_interval: Duration,
    pub poll_interval: Duration,
    pub max_poll_backoff: Duration,
    pub saturation_backoff: Duration,
    pub saturation_patience: Duration,
    pub transient_retry_cap: u32,
    pub format_retry_cap: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub collect_interval: Duration,
    pub per_account_concurrency: usize,
    pub monitor_interval: Duration,
    pub low_balance_interval: Duration,
    pub balance_query_timeout: Duration,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let hub = &config.hub;
        let accounts = &config.accounts;
        Self {
            workers: hub.workers.max(1) as usize,
            lease: Duration::from_secs(hub.lease_secs),
            reclaim_interval: Duration::from_secs(hub.reclaim_interval_secs),
            poll_interval: Duration::from_millis(hub.poll_interval_ms),
            max_poll_backoff: Duration::from_millis(hub.max_poll_backoff_ms),
            saturation_backoff: Duration::from_millis(hub.saturation_backoff_ms),
            saturation_patience: Duration::from_secs(hub.saturation_patience_secs),
            transient_retry_cap: hub.transient_retry_cap.max(1),
            format_retry_cap: hub.format_retry_cap.max(1),
            retry_base_delay: Duration::from_millis(hub.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(hub.retry_max_delay_ms),
            collect_interval: Duration::from_secs(hub.collect_interval_secs),
            per_account_concurrency: accounts.per_account_concurrency.max(1) as usize,
            monitor_interval: Duration::from_secs(accounts.monitor_interval_secs),
            low_balance_interval: Duration::from_secs(accounts.low_balance_interval_secs),
            balance_query_timeout: Duration::from_secs(accounts.query_timeout_secs),
        }
    }
}

/// Balance thresholds driving account state transitions.
#[derive(Debug, Clone, Copy)]
pub struct BalancePolicy {
    pub low_balance_threshold: f64,
    pub exhausted_floor: f64,
}

impl From<&AppConfig> for BalancePolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            low_balance_threshold: config.accounts.low_balance_threshold,
            exhausted_floor: config.accounts.exhausted_floor,
        }
    }
}

/// Bounds enforced by the result validator.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    pub score_min: f64,
    pub score_max: f64,
    pub classifications: Vec<String>,
    pub summary_max_chars: usize,
}

impl From<&AppConfig> for SchemaConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            score_min: config.validation.score_min,
            score_max: config.validation.score_max,
            classifications: config.validation.classifications.clone(),
            summary_max_chars: config.validation.summary_max_chars,
        }
    }
}

/// A resolved account ready to seed the rotation pool.
#[derive(Debug, Clone)]
pub struct AccountSeed {
    pub id: String,
    pub credential: Credential,
    pub initial_balance_hint: Option<f64>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.intelhub/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| IntelHubError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.intelhub/intelhub.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| IntelHubError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        IntelHubError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    check_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| IntelHubError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| IntelHubError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| IntelHubError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject internally inconsistent settings.
fn check_config(config: &AppConfig) -> Result<()> {
    let h = &config.hub;
    if h.lease_secs == 0 {
        return Err(IntelHubError::config("hub.lease_secs must be at least 1"));
    }
    if h.saturation_backoff_ms >= h.lease_secs.saturating_mul(1000) {
        return Err(IntelHubError::config(format!(
            "hub.saturation_backoff_ms ({}) must be shorter than the lease ({}s)",
            h.saturation_backoff_ms, h.lease_secs
        )));
    }
    let v = &config.validation;
    if v.score_min > v.score_max {
        return Err(IntelHubError::config(format!(
            "validation.score_min ({}) exceeds score_max ({})",
            v.score_min, v.score_max
        )));
    }
    if v.classifications.is_empty() {
        return Err(IntelHubError::config(
            "validation.classifications must not be empty",
        ));
    }
    let a = &config.accounts;
    if a.exhausted_floor > a.low_balance_threshold {
        return Err(IntelHubError::config(format!(
            "accounts.exhausted_floor ({}) exceeds low_balance_threshold ({})",
            a.exhausted_floor, a.low_balance_threshold
        )));
    }
    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Resolve account credentials from env vars and the optional keys file.
///
/// Missing env vars are skipped with a warning; an empty result is an error.
pub fn resolve_account_seeds(config: &AppConfig) -> Result<Vec<AccountSeed>> {
    let mut seeds = Vec::new();

    for entry in &config.accounts.keys {
        match std::env::var(&entry.api_key_env) {
            Ok(val) if !val.trim().is_empty() => seeds.push(AccountSeed {
                id: entry.id.clone(),
                credential: Credential::new(val.trim()),
                initial_balance_hint: entry.initial_balance_hint,
            }),
            _ => tracing::warn!(
                account = %entry.id,
                env = %entry.api_key_env,
                "account key env var not set, skipping"
            ),
        }
    }

    if let Some(file) = &config.accounts.keys_file {
        let path = expand_home(file);
        let content = std::fs::read_to_string(&path).map_err(|e| IntelHubError::io(&path, e))?;
        for (n, line) in content.lines().enumerate() {
            let key = line.trim();
            if key.is_empty() || key.starts_with('#') {
                continue;
            }
            if seeds.iter().any(|s| s.credential.expose() == key) {
                continue;
            }
            seeds.push(AccountSeed {
                id: format!("keyfile-{}", n + 1),
                credential: Credential::new(key),
                initial_balance_hint: None,
            });
        }
    }

    if seeds.is_empty() {
        return Err(IntelHubError::config(
            "no account credentials resolved. Set the env vars named in [[accounts.keys]] \
             or point accounts.keys_file at a file with one key per line",
        ));
    }

    Ok(seeds)
}
