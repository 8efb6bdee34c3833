use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{errors, RetryPolicy, SpensoResult};

// Default configuration values
const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com";
const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com";
const DEFAULT_REQUEST_URI: &str = "http://localhost";
const DEFAULT_STORE_URL: &str = "https://firestore.googleapis.com";
const DEFAULT_USERS_COLLECTION: &str = "users";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 3600;
const DEFAULT_NETWORK_RETRY_DELAY_SECONDS: u64 = 300;
const DEFAULT_MAX_NETWORK_RETRIES: u32 = 12;
const DEFAULT_PROFILE_WRITE_ATTEMPTS: usize = 2;
const DEFAULT_PROFILE_RETRY_DELAY_MILLIS: u64 = 1000;
const DEFAULT_DATA_DIR: &str = "./.spenso";
const DEFAULT_CONFIG_FILE: &str = "spenso.config.json";

// Longest refresh interval we accept (30 days)
const MAX_REFRESH_INTERVAL_SECONDS: u64 = 30 * 24 * 3600;

/// Main configuration struct for Spenso
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Identity provider configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Document store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Session lifecycle tuning
    #[serde(default)]
    pub session: SessionConfig,
    /// Directory holding the session cache and local settings
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Identity provider (Firebase Auth) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Web API key of the project
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Base URL of the identity toolkit API
    #[serde(default = "default_identity_url")]
    pub identity_url: String,
    /// Base URL of the secure token API
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Redirect URI reported with federated sign-ins
    #[serde(default = "default_request_uri")]
    pub request_uri: String,
    /// HTTP timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Document store (Firestore) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub base_url: String,
    #[serde(default = "default_project_id")]
    pub project_id: String,
    /// Collection holding one profile document per account
    #[serde(default = "default_users_collection")]
    pub users_collection: String,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Token age after which the session is refreshed
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Wait before retrying a refresh that failed on the network
    #[serde(default = "default_network_retry_delay")]
    pub network_retry_delay_seconds: u64,
    /// Consecutive transient refresh failures tolerated before signing out
    #[serde(default = "default_max_network_retries")]
    pub max_network_retries: u32,
    /// Attempts per profile sync
    #[serde(default = "default_profile_write_attempts")]
    pub profile_write_attempts: usize,
    /// Wait between profile sync attempts
    #[serde(default = "default_profile_retry_delay")]
    pub profile_retry_delay_millis: u64,
}

impl SessionConfig {
    pub fn refresh_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_interval_seconds.min(MAX_REFRESH_INTERVAL_SECONDS) as i64)
    }

    pub fn network_retry_delay(&self) -> Duration {
        Duration::from_secs(self.network_retry_delay_seconds)
    }

    /// Retry policy applied to profile writes
    pub fn profile_write_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed_delay(
            self.profile_write_attempts,
            Duration::from_millis(self.profile_retry_delay_millis),
        )
    }
}

// Default functions
fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(fallback)
}

fn default_api_key() -> String {
    std::env::var("SPENSO_API_KEY").unwrap_or_default()
}

fn default_identity_url() -> String {
    env_or("SPENSO_IDENTITY_URL", DEFAULT_IDENTITY_URL.to_string())
}

fn default_token_url() -> String {
    env_or("SPENSO_TOKEN_URL", DEFAULT_TOKEN_URL.to_string())
}

fn default_request_uri() -> String {
    env_or("SPENSO_REQUEST_URI", DEFAULT_REQUEST_URI.to_string())
}

fn default_timeout() -> u64 {
    env_or("SPENSO_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECONDS)
}

fn default_store_url() -> String {
    env_or("SPENSO_STORE_URL", DEFAULT_STORE_URL.to_string())
}

fn default_project_id() -> String {
    std::env::var("SPENSO_PROJECT_ID").unwrap_or_default()
}

fn default_users_collection() -> String {
    env_or("SPENSO_USERS_COLLECTION", DEFAULT_USERS_COLLECTION.to_string())
}

fn default_refresh_interval() -> u64 {
    env_or("SPENSO_REFRESH_INTERVAL_SECONDS", DEFAULT_REFRESH_INTERVAL_SECONDS)
}

fn default_network_retry_delay() -> u64 {
    env_or("SPENSO_NETWORK_RETRY_DELAY_SECONDS", DEFAULT_NETWORK_RETRY_DELAY_SECONDS)
}

fn default_max_network_retries() -> u32 {
    env_or("SPENSO_MAX_NETWORK_RETRIES", DEFAULT_MAX_NETWORK_RETRIES)
}

fn default_profile_write_attempts() -> usize {
    env_or("SPENSO_PROFILE_WRITE_ATTEMPTS", DEFAULT_PROFILE_WRITE_ATTEMPTS)
}

fn default_profile_retry_delay() -> u64 {
    env_or("SPENSO_PROFILE_RETRY_DELAY_MILLIS", DEFAULT_PROFILE_RETRY_DELAY_MILLIS)
}

fn default_data_dir() -> PathBuf {
    env_or("SPENSO_DATA_DIR", PathBuf::from(DEFAULT_DATA_DIR))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            store: StoreConfig::default(),
            session: SessionConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            identity_url: default_identity_url(),
            token_url: default_token_url(),
            request_uri: default_request_uri(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            project_id: default_project_id(),
            users_collection: default_users_collection(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval(),
            network_retry_delay_seconds: default_network_retry_delay(),
            max_network_retries: default_max_network_retries(),
            profile_write_attempts: default_profile_write_attempts(),
            profile_retry_delay_millis: default_profile_retry_delay(),
        }
    }
}

impl Config {
    /// Reject values the services cannot run with
    pub fn validate(&self) -> SpensoResult<()> {
        let session = &self.session;
        if session.refresh_interval_seconds == 0 {
            return Err(errors::config_invalid(
                "session.refresh_interval_seconds",
                "0",
                "refresh interval must be positive",
            )
            .into());
        }
        if session.refresh_interval_seconds > MAX_REFRESH_INTERVAL_SECONDS {
            return Err(errors::config_invalid(
                "session.refresh_interval_seconds",
                session.refresh_interval_seconds.to_string(),
                "refresh interval must be at most 30 days",
            )
            .into());
        }
        if session.profile_write_attempts == 0 {
            return Err(errors::config_invalid(
                "session.profile_write_attempts",
                "0",
                "at least one attempt is required",
            )
            .into());
        }
        if self.identity.timeout_seconds == 0 {
            return Err(errors::config_invalid(
                "identity.timeout_seconds",
                "0",
                "timeout must be positive",
            )
            .into());
        }
        Ok(())
    }

    /// Check that the remote backends can be reached with this configuration
    pub fn require_remote(&self) -> SpensoResult<()> {
        if self.identity.api_key.is_empty() {
            return Err(errors::config_missing("identity.api_key").into());
        }
        if self.store.project_id.is_empty() {
            return Err(errors::config_missing("store.project_id").into());
        }
        Ok(())
    }
}

/// Manages configuration for the application
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from the path named by `SPENSO_CONFIG_PATH`
    pub async fn from_env() -> SpensoResult<Self> {
        let config_path = std::env::var("SPENSO_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load(config_path).await
    }

    /// Load configuration from `path`, creating it with defaults if missing
    pub async fn load(path: impl Into<PathBuf>) -> SpensoResult<Self> {
        let config_path = path.into();
        let config = load_or_create_config(&config_path).await?;
        config.validate()?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a clone of the current configuration
    pub async fn get_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Replace the configuration and save it
    pub async fn update_config(&self, new_config: Config) -> SpensoResult<()> {
        new_config.validate()?;

        // Save to disk
        save_config(&self.config_path, &new_config).await?;

        // Update in memory
        *self.config.write().await = new_config;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Load configuration from file or create default
async fn load_or_create_config(path: &Path) -> SpensoResult<Config> {
    // Check if file exists
    if !fs::try_exists(path)
        .await
        .map_err(|e| errors::storage_io(path.display(), e))?
    {
        // Create default config
        let default_config = Config::default();
        save_config(path, &default_config).await?;
        info!("Created default configuration at {}", path.display());
        return Ok(default_config);
    }

    // Load existing config
    let config_str = fs::read_to_string(path)
        .await
        .map_err(|e| errors::storage_io(path.display(), e))?;
    let config: Config = serde_json::from_str(&config_str)?;
    debug!("Loaded configuration from {}", path.display());

    Ok(config)
}

/// Save configuration to file
async fn save_config(path: &Path, config: &Config) -> SpensoResult<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| errors::storage_io(parent.display(), e))?;
    }

    // Serialize and write
    let config_str = serde_json::to_string_pretty(config)?;
    fs::write(path, config_str)
        .await
        .map_err(|e| errors::storage_io(path.display(), e))?;
    debug!("Saved configuration to {}", path.display());

    Ok(())
}
