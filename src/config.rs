use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::providers::pricing::ImagePrice;
use crate::quota::QuotaLimits;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Get all overrides as a map of setting key -> env var name.
    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
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
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
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

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Name of the admin created on first run when the users table is empty.
    #[serde(default = "default_admin_name")]
    pub default_admin_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_admin_name: default_admin_name(),
        }
    }
}

/// Where quota counters are kept.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Sqlite,
    Memory,
}

impl std::fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for LedgerBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            _ => Err(format!("Unknown ledger backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_text_unit_limit")]
    pub default_text_unit_limit: u64,
    #[serde(default = "default_image_unit_limit")]
    pub default_image_unit_limit: f64,
    #[serde(default)]
    pub ledger: LedgerBackend,
}

impl QuotaConfig {
    /// Limits given to a newly provisioned user.
    pub fn default_limits(&self) -> QuotaLimits {
        QuotaLimits {
            text_unit_limit: self.default_text_unit_limit,
            image_unit_limit: self.default_image_unit_limit,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_text_unit_limit: default_text_unit_limit(),
            default_image_unit_limit: default_image_unit_limit(),
            ledger: LedgerBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai_images: OpenAiImagesConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenAiImagesConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// Upstream key. Requests are sent unauthenticated when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
}

impl Default for OpenAiImagesConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            api_key: None,
            timeout_secs: default_image_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiConfig {
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_text_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_base_url(),
            api_key: None,
            model: default_gemini_model(),
            timeout_secs: default_text_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PricingConfig {
    /// Extra or replacement `[[pricing.image]]` entries.
    #[serde(default)]
    pub image: Vec<ImagePrice>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8400
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("tollgate.db")
}
fn default_admin_name() -> String {
    "admin".to_string()
}
const fn default_text_unit_limit() -> u64 {
    1_000_000
}
const fn default_image_unit_limit() -> f64 {
    4.0
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
const fn default_image_timeout() -> u64 {
    120
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_gemini_model() -> String {
    "gemini-1.5-pro-latest".to_string()
}
const fn default_text_timeout() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
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
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Every scalar setting has a corresponding `TOLLGATE_*` env var. When
    /// set, the env var value replaces the file/default value and the setting
    /// key is recorded in `env_overrides`.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        // -- Helpers (macros for concise per-field overrides) --

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
                    } else {
                        tracing::warn!(env = $env, "Ignoring unparseable environment override");
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
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

        // -- Database --
        env_path!("database.path", "TOLLGATE_DATABASE_PATH", self.database.path);

        // -- Auth --
        env_str!(
            "auth.default_admin_name",
            "TOLLGATE_AUTH_ADMIN_NAME",
            self.auth.default_admin_name
        );

        // -- Quota --
        env_parse!(
            "quota.default_text_unit_limit",
            "TOLLGATE_QUOTA_TEXT_LIMIT",
            self.quota.default_text_unit_limit
        );
        env_parse!(
            "quota.default_image_unit_limit",
            "TOLLGATE_QUOTA_IMAGE_LIMIT",
            self.quota.default_image_unit_limit
        );
        env_parse!("quota.ledger", "TOLLGATE_QUOTA_LEDGER", self.quota.ledger);

        // -- Providers --
        env_str!(
            "providers.openai_images.base_url",
            "TOLLGATE_OPENAI_BASE_URL",
            self.providers.openai_images.base_url
        );
        env_opt_str!(
            "providers.openai_images.api_key",
            "TOLLGATE_OPENAI_API_KEY",
            self.providers.openai_images.api_key
        );
        env_parse!(
            "providers.openai_images.timeout_secs",
            "TOLLGATE_OPENAI_TIMEOUT",
            self.providers.openai_images.timeout_secs
        );
        env_str!(
            "providers.gemini.base_url",
            "TOLLGATE_GEMINI_BASE_URL",
            self.providers.gemini.base_url
        );
        env_opt_str!(
            "providers.gemini.api_key",
            "TOLLGATE_GEMINI_API_KEY",
            self.providers.gemini.api_key
        );
        env_str!(
            "providers.gemini.model",
            "TOLLGATE_GEMINI_MODEL",
            self.providers.gemini.model
        );
        env_parse!(
            "providers.gemini.timeout_secs",
            "TOLLGATE_GEMINI_TIMEOUT",
            self.providers.gemini.timeout_secs
        );

        // -- Logging --
        env_str!("logging.level", "TOLLGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "TOLLGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
