use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::providers::pricing::ModelPricing;
use crate::providers::rotation::CredentialKind;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "server.host") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Sorted list of overridden setting keys.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.overrides.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Provider credentials imported into the key pool at startup.
    #[serde(default)]
    pub keys: Vec<SeedKey>,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted request body, including audio uploads.
    #[serde(default = "default_body_limit")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            max_body_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Where counters, cursors and cache entries live, and how counters are bumped.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub counter_policy: CounterPolicy,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// `kv` table in the main SQLite database (shared by every worker).
    #[default]
    Sqlite,
    /// Process-local map. Counters are not shared across instances.
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown store backend: {s}")),
        }
    }
}

/// How shared counters (rate-limit buckets, rotation cursors, key usage) are
/// updated.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CounterPolicy {
    /// Read the current value, then write value + 1. Concurrent callers can
    /// observe the same value and overshoot limits.
    #[default]
    ReadThenWrite,
    /// Single increment-and-return operation in the store.
    Atomic,
}

impl std::fmt::Display for CounterPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadThenWrite => write!(f, "read_then_write"),
            Self::Atomic => write!(f, "atomic"),
        }
    }
}

impl FromStr for CounterPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "read_then_write" => Ok(Self::ReadThenWrite),
            "atomic" => Ok(Self::Atomic),
            _ => Err(format!("Unknown counter policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// Bearer token for the `/admin` routes. Admin routes are disabled when unset.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

/// Defaults applied to newly provisioned projects.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// 0 disables the hourly window.
    #[serde(default)]
    pub requests_per_hour: u32,
    /// 0 disables the daily window.
    #[serde(default)]
    pub requests_per_day: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: 0,
            requests_per_day: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold_percent: u8,
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold_percent: u8,
    /// Monthly allowance for projects provisioned without an explicit budget.
    #[serde(default = "default_monthly_budget")]
    pub default_monthly_budget: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_percent: default_warning_threshold(),
            emergency_threshold_percent: default_emergency_threshold(),
            default_monthly_budget: default_monthly_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// How often expired key-value rows are purged.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    LeastUsed,
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastUsed => write!(f, "least_used"),
        }
    }
}

impl FromStr for RotationStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_used" | "leastused" => Ok(Self::LeastUsed),
            _ => Err(format!("Unknown rotation strategy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub strategy: RotationStrategy,
    /// When true each project keeps its own round-robin cursor; otherwise a
    /// single global cursor per provider is shared.
    #[serde(default = "default_true")]
    pub per_project: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            per_project: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderEndpoint::gemini")]
    pub gemini: ProviderEndpoint,
    #[serde(default = "ProviderEndpoint::openai")]
    pub openai: ProviderEndpoint,
    #[serde(default)]
    pub audio: AudioProviderConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl ProviderEndpoint {
    fn gemini() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            timeout_secs: default_provider_timeout(),
        }
    }

    fn openai() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self::gemini()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioProviderConfig {
    #[serde(default = "default_audio_base_url")]
    pub base_url: String,
    #[serde(default = "default_audio_model")]
    pub model: String,
    /// Caller-supplied models that are forwarded to the transcription
    /// endpoint as-is. Anything else is replaced by `model`.
    #[serde(default = "default_audio_model_patterns")]
    pub model_patterns: Vec<String>,
    /// Price per minute of audio.
    #[serde(default = "default_audio_price")]
    pub price_per_minute: f64,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for AudioProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_audio_base_url(),
            model: default_audio_model(),
            model_patterns: default_audio_model_patterns(),
            price_per_minute: default_audio_price(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// Model pattern lists for the text providers. Evaluation order is fixed:
/// audio first, then Gemini, then OpenAI, then the default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "default_gemini_patterns")]
    pub gemini_patterns: Vec<String>,
    #[serde(default = "default_openai_patterns")]
    pub openai_patterns: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            gemini_patterns: default_gemini_patterns(),
            openai_patterns: default_openai_patterns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Flat rate per token for models without a price entry.
    #[serde(default = "default_fallback_per_token")]
    pub fallback_per_token: f64,
    /// Extra or replacement price entries.
    #[serde(default)]
    pub models: Vec<ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fallback_per_token: default_fallback_per_token(),
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Maximum provider calls in flight.
    #[serde(default = "default_dispatch_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How long shutdown waits for queued work to drain.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_dispatch_concurrency(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Include request/response text in debug logs.
    #[serde(default)]
    pub log_content: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_content: false,
        }
    }
}

/// A provider credential declared in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedKey {
    pub provider: String,
    pub credential: String,
    #[serde(default)]
    pub kind: CredentialKind,
    #[serde(default = "default_seed_models")]
    pub models: Vec<String>,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8480
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_body_limit() -> usize {
    25 * 1024 * 1024
}
fn default_db_path() -> PathBuf {
    PathBuf::from("tollgate.db")
}
const fn default_true() -> bool {
    true
}
const fn default_requests_per_minute() -> u32 {
    60
}
const fn default_warning_threshold() -> u8 {
    80
}
const fn default_emergency_threshold() -> u8 {
    95
}
const fn default_monthly_budget() -> f64 {
    10.0
}
const fn default_cache_ttl() -> u64 {
    900
}
const fn default_purge_interval() -> u64 {
    300
}
const fn default_provider_timeout() -> u64 {
    120
}
fn default_audio_base_url() -> String {
    "https://api.groq.com/openai".to_string()
}
fn default_audio_model() -> String {
    "whisper-large-v3".to_string()
}
fn default_audio_model_patterns() -> Vec<String> {
    vec!["whisper-*".to_string(), "distil-whisper-*".to_string()]
}
const fn default_audio_price() -> f64 {
    0.006
}
fn default_gemini_patterns() -> Vec<String> {
    vec!["gemini-*".to_string()]
}
fn default_openai_patterns() -> Vec<String> {
    vec![
        "gpt-*".to_string(),
        "whisper-*".to_string(),
        "openai/*".to_string(),
    ]
}
const fn default_fallback_per_token() -> f64 {
    0.000_002
}
const fn default_dispatch_concurrency() -> usize {
    8
}
const fn default_queue_capacity() -> usize {
    1024
}
const fn default_drain_timeout() -> u64 {
    30
}
const fn default_max_retries() -> u32 {
    2
}
const fn default_initial_backoff_ms() -> u64 {
    500
}
const fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_seed_models() -> Vec<String> {
    vec!["*".to_string()]
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `TOLLGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject settings that would make the gateway misbehave at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.budget.warning_threshold_percent > self.budget.emergency_threshold_percent {
            anyhow::bail!(
                "budget.warning_threshold_percent ({}) must not exceed budget.emergency_threshold_percent ({})",
                self.budget.warning_threshold_percent,
                self.budget.emergency_threshold_percent
            );
        }
        if self.dispatch.concurrency == 0 || self.dispatch.queue_capacity == 0 {
            anyhow::bail!("dispatch.concurrency and dispatch.queue_capacity must be > 0");
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be > 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_opt_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                    ov.record($key, $env);
                }
            };
        }

        // -- Server --
        env_str!("server.host", "TOLLGATE_SERVER_HOST", self.server.host);
        env_parse!("server.port", "TOLLGATE_SERVER_PORT", self.server.port);
        if let Ok(val) = std::env::var("TOLLGATE_SERVER_CORS_ORIGINS") {
            self.server.cors_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            ov.record("server.cors_origins", "TOLLGATE_SERVER_CORS_ORIGINS");
        }

        // -- Database / store --
        if let Ok(val) = std::env::var("TOLLGATE_DATABASE_PATH") {
            self.database.path = PathBuf::from(val);
            ov.record("database.path", "TOLLGATE_DATABASE_PATH");
        }
        env_parse!("store.backend", "TOLLGATE_STORE_BACKEND", self.store.backend);
        env_parse!(
            "store.counter_policy",
            "TOLLGATE_COUNTER_POLICY",
            self.store.counter_policy
        );

        // -- Auth --
        env_opt_str!("auth.admin_token", "TOLLGATE_ADMIN_TOKEN", self.auth.admin_token);

        // -- Limits / budget --
        env_parse!(
            "limits.requests_per_minute",
            "REQUESTS_PER_MINUTE",
            self.limits.requests_per_minute
        );
        env_parse!(
            "limits.requests_per_minute",
            "TOLLGATE_REQUESTS_PER_MINUTE",
            self.limits.requests_per_minute
        );
        env_bool!("budget.enabled", "TOLLGATE_BUDGET_ENABLED", self.budget.enabled);
        env_parse!(
            "budget.warning_threshold_percent",
            "TOLLGATE_BUDGET_WARNING_THRESHOLD",
            self.budget.warning_threshold_percent
        );
        env_parse!(
            "budget.emergency_threshold_percent",
            "TOLLGATE_BUDGET_EMERGENCY_THRESHOLD",
            self.budget.emergency_threshold_percent
        );

        // -- Cache --
        env_bool!("cache.enabled", "TOLLGATE_CACHE_ENABLED", self.cache.enabled);
        env_parse!("cache.ttl_secs", "CACHE_TTL_SECONDS", self.cache.ttl_secs);
        env_parse!("cache.ttl_secs", "TOLLGATE_CACHE_TTL_SECONDS", self.cache.ttl_secs);

        // -- Rotation --
        env_parse!(
            "rotation.strategy",
            "TOLLGATE_ROTATION_STRATEGY",
            self.rotation.strategy
        );
        env_bool!(
            "rotation.per_project",
            "TOLLGATE_ROTATION_PER_PROJECT",
            self.rotation.per_project
        );

        // -- Providers --
        env_str!(
            "providers.gemini.base_url",
            "TOLLGATE_GEMINI_BASE_URL",
            self.providers.gemini.base_url
        );
        env_str!(
            "providers.openai.base_url",
            "TOLLGATE_OPENAI_BASE_URL",
            self.providers.openai.base_url
        );
        env_str!(
            "providers.audio.base_url",
            "TOLLGATE_AUDIO_BASE_URL",
            self.providers.audio.base_url
        );

        // -- Dispatch / retry --
        env_parse!(
            "dispatch.concurrency",
            "TOLLGATE_DISPATCH_CONCURRENCY",
            self.dispatch.concurrency
        );
        env_parse!("retry.max_retries", "TOLLGATE_MAX_RETRIES", self.retry.max_retries);

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);
        env_bool!(
            "logging.log_content",
            "TOLLGATE_LOG_CONTENT",
            self.logging.log_content
        );

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
