//! Configuration surface. Mirrors the options table in the design
//! notes one-to-one; everything has a sane default so a bare `[keys]`
//! section in the TOML file is enough to boot.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keys: KeyRegistryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Name of the env var read once at startup for the bearer token. Unset
    /// or empty means auth is disabled (dev mode).
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            api_token_env: d_api_token_env(),
            cors: CorsConfig::default(),
        }
    }
}

fn d_port() -> u16 {
    8089
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_api_token_env() -> String {
    "KEYGATE_API_TOKEN".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into()]
}

/// `MAX_FAILURES` — failure counter ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRegistryConfig {
    #[serde(default = "d_max_failures")]
    pub max_failures: u32,
    /// Comma-separated list of keys read from this env var at startup (and
    /// again on a reload trigger). Preferred over `keys_file` when both are
    /// set.
    #[serde(default = "d_keys_env_var")]
    pub keys_env_var: String,
    /// Newline-separated key file, read if `keys_env_var` isn't set.
    #[serde(default)]
    pub keys_file: Option<String>,
}

impl Default for KeyRegistryConfig {
    fn default() -> Self {
        Self {
            max_failures: d_max_failures(),
            keys_env_var: d_keys_env_var(),
            keys_file: None,
        }
    }
}

fn d_keys_env_var() -> String {
    "KEYGATE_KEYS".into()
}

fn d_max_failures() -> u32 {
    5
}

/// Valid Key Pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_pool_size")]
    pub pool_size: usize,
    #[serde(default = "d_ttl_hours")]
    pub key_ttl_hours: i64,
    #[serde(default = "d_min_threshold")]
    pub min_threshold: usize,
    #[serde(default = "d_emergency_refill_count")]
    pub emergency_refill_count: usize,
    #[serde(default = "d_maintenance_minutes")]
    pub maintenance_interval_minutes: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: d_pool_size(),
            key_ttl_hours: d_ttl_hours(),
            min_threshold: d_min_threshold(),
            emergency_refill_count: d_emergency_refill_count(),
            maintenance_interval_minutes: d_maintenance_minutes(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_pool_size() -> usize {
    50
}
fn d_ttl_hours() -> i64 {
    2
}
fn d_min_threshold() -> usize {
    10
}
fn d_emergency_refill_count() -> usize {
    10
}
fn d_maintenance_minutes() -> u64 {
    5
}

/// `MAX_RETRIES` — retry handler attempt cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: d_max_retries(),
        }
    }
}

fn d_max_retries() -> u32 {
    3
}

/// Scheduled verifier tuning plus the wall-clock inputs
/// model cooldown computation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    #[serde(default = "d_check_interval_hours")]
    pub check_interval_hours: f64,
    #[serde(default = "d_test_model")]
    pub test_model: String,
    #[serde(default = "d_timezone")]
    pub timezone: String,
    #[serde(default = "d_quota_reset_hour")]
    pub quota_reset_hour: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            batch_size: d_batch_size(),
            check_interval_hours: d_check_interval_hours(),
            test_model: d_test_model(),
            timezone: d_timezone(),
            quota_reset_hour: d_quota_reset_hour(),
        }
    }
}

fn d_batch_size() -> usize {
    20
}
fn d_check_interval_hours() -> f64 {
    6.0
}
fn d_test_model() -> String {
    "test-model".into()
}
fn d_timezone() -> String {
    "America/Los_Angeles".into()
}
fn d_quota_reset_hour() -> u32 {
    0
}

/// Where the upstream provider lives and how long requests may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "d_verification_timeout_ms")]
    pub verification_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            request_timeout_ms: d_request_timeout_ms(),
            verification_timeout_ms: d_verification_timeout_ms(),
        }
    }
}

fn d_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn d_request_timeout_ms() -> u64 {
    60_000
}
fn d_verification_timeout_ms() -> u64 {
    5_000
}
