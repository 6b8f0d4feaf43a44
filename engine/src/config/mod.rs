//! Configuration management
//!
//! This module handles loading, validation, and management of the Plexus
//! runtime configuration. Configuration is stored in TOML format at
//! ~/.plexus/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory and log level
//! - **loader**: Load timeout and supported platforms
//! - **security**: Policy, trusted/blocked sources, trusted keys, scan thresholds
//! - **download**: Concurrency cap, retries, resume and verification switches
//! - **hot_reload**: Debounce, state preservation, history size
//! - **messaging**: Response timeout and subscriber queue size
//!
//! Every section except `core` may be omitted; omitted sections take their
//! defaults. Each runtime service receives only its own section.
//!
//! # Examples
//!
//! ```no_run
//! use plexus_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Policy: {:?}", config.security.policy);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::manifest::KNOWN_PLATFORMS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core runtime settings
    pub core: CoreConfig,

    /// Plugin loader settings
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Package security settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Downloader settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Hot reload settings
    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    /// Event bus and messenger settings
    #[serde(default)]
    pub messaging: MessagingConfig,
}

/// Core runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion); plugins live under `plugins/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Plugin loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Time allowed for register + initialize + start
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Platforms this host can run plugins on
    #[serde(default = "default_supported_platforms")]
    pub supported_platforms: Vec<String>,
}

/// Security policy names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    /// Signature, trusted source and clean scan all required
    Enterprise,
    /// Signature or trusted source, and no high-severity findings
    Standard,
    /// Only critical findings block
    Relaxed,
}

impl std::str::FromStr for SecurityPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enterprise" => Ok(SecurityPolicy::Enterprise),
            "standard" => Ok(SecurityPolicy::Standard),
            "relaxed" => Ok(SecurityPolicy::Relaxed),
            other => Err(EngineError::Config(format!(
                "Invalid security policy '{}'. Must be one of: enterprise, standard, relaxed",
                other
            ))),
        }
    }
}

/// Package security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_policy")]
    pub policy: SecurityPolicy,

    /// Host patterns or URL prefixes that are trusted (`*.example.com` matches subdomains)
    #[serde(default)]
    pub trusted_sources: Vec<String>,

    /// Host patterns or URL prefixes that are always rejected
    #[serde(default)]
    pub blocked_sources: Vec<String>,

    /// Hex-encoded ed25519 keys allowed to issue signing certificates
    #[serde(default)]
    pub trusted_root_keys: Vec<String>,

    /// Hex-encoded ed25519 keys of trusted timestamp authorities
    #[serde(default)]
    pub timestamp_authority_keys: Vec<String>,

    /// Serial numbers of revoked certificates
    #[serde(default)]
    pub revoked_certificates: Vec<String>,

    #[serde(default = "default_supported_algorithms")]
    pub supported_algorithms: Vec<String>,

    /// Packages larger than this are flagged
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u64,

    /// Lines longer than this count towards the obfuscation ratio
    #[serde(default = "default_long_line_threshold")]
    pub long_line_threshold: usize,

    /// Share of long lines above which a file is flagged as obfuscated
    #[serde(default = "default_obfuscation_ratio")]
    pub obfuscation_ratio: f64,

    /// Number of validation results kept in history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Downloader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between retries
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Continue partial files with a range request
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Run the security pipeline on completed downloads
    #[serde(default = "default_true")]
    pub verify_signature: bool,

    /// Minimum interval between progress updates
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Poll interval while a download is paused
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

/// Hot reload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period before a watched change triggers a reload
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Snapshot and restore state on watch-triggered reloads
    #[serde(default = "default_true")]
    pub preserve_state: bool,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Event bus and messenger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_message_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Capacity of each subscriber's queue
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.plexus")
}

fn default_load_timeout_ms() -> u64 {
    30_000
}

fn default_supported_platforms() -> Vec<String> {
    KNOWN_PLATFORMS.iter().map(|p| p.to_string()).collect()
}

fn default_policy() -> SecurityPolicy {
    SecurityPolicy::Standard
}

fn default_supported_algorithms() -> Vec<String> {
    vec!["ed25519".to_string()]
}

fn default_max_package_size() -> u64 {
    50 * 1024 * 1024
}

fn default_long_line_threshold() -> usize {
    500
}

fn default_obfuscation_ratio() -> f64 {
    0.1
}

fn default_history_limit() -> usize {
    100
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_pause_poll_ms() -> u64 {
    100
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_subscriber_buffer() -> usize {
    100
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            supported_platforms: default_supported_platforms(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            trusted_sources: Vec::new(),
            blocked_sources: Vec::new(),
            trusted_root_keys: Vec::new(),
            timestamp_authority_keys: Vec::new(),
            revoked_certificates: Vec::new(),
            supported_algorithms: default_supported_algorithms(),
            max_package_size: default_max_package_size(),
            long_line_threshold: default_long_line_threshold(),
            obfuscation_ratio: default_obfuscation_ratio(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            resume: true,
            verify_signature: true,
            progress_interval_ms: default_progress_interval_ms(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            preserve_state: true,
            history_limit: default_history_limit(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_message_timeout_ms(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Config {
    /// Read `~/.plexus/config.toml`, writing a default file first when none exists
    pub fn load_or_create() -> Result<Self, EngineError> {
        let path = home_dir()?.join(".plexus").join("config.toml");
        match path.exists() {
            true => Self::load_from_path(&path),
            false => Self::write_default(&path),
        }
    }

    /// Read, parse and validate the file at `path`
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path).map_err(config_error("read", path))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Invalid config TOML: {}", e)))?;
        config.validate_and_process()?;
        Ok(config)
    }

    fn write_default(path: &Path) -> Result<Self, EngineError> {
        let mut config = Self::default_config();
        config.validate_and_process()?;

        let text = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Cannot render default config: {}", e)))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(config_error("create", dir))?;
        }
        fs::write(path, text).map_err(config_error("write", path))?;

        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig::default(),
            loader: LoaderConfig::default(),
            security: SecurityConfig::default(),
            download: DownloadConfig::default(),
            hot_reload: HotReloadConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }

    /// Directory holding installed plugin packages
    pub fn plugins_dir(&self) -> PathBuf {
        self.core.data_dir.join("plugins")
    }

    /// Validate values and expand the data directory path
    ///
    /// The data directory is created if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.loader.load_timeout_ms == 0 {
            return Err(EngineError::Config(
                "load_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.loader.supported_platforms.is_empty() {
            return Err(EngineError::Config(
                "supported_platforms must list at least one platform".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.security.obfuscation_ratio) {
            return Err(EngineError::Config(
                "obfuscation_ratio must be between 0.0 and 1.0".to_string(),
            ));
        }

        for key in self
            .security
            .trusted_root_keys
            .iter()
            .chain(&self.security.timestamp_authority_keys)
        {
            match hex::decode(key) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => {
                    return Err(EngineError::Config(format!(
                        "Invalid ed25519 public key '{}': expected 64 hex characters",
                        key
                    )))
                }
            }
        }

        if self.download.max_concurrent == 0 {
            return Err(EngineError::Config(
                "download.max_concurrent must be at least 1".to_string(),
            ));
        }

        if self.messaging.subscriber_buffer == 0 {
            return Err(EngineError::Config(
                "messaging.subscriber_buffer must be at least 1".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        fs::create_dir_all(&self.core.data_dir).map_err(config_error("create", &self.core.data_dir))?;

        Ok(())
    }
}

fn home_dir() -> Result<PathBuf, EngineError> {
    dirs::home_dir().ok_or_else(|| EngineError::Config("No home directory for this user".to_string()))
}

fn config_error(action: &'static str, path: &Path) -> impl Fn(std::io::Error) -> EngineError {
    let path = path.display().to_string();
    move |e| EngineError::Config(format!("Cannot {} {}: {}", action, path, e))
}

/// Replace a leading `~` with the home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(home_dir()?.join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}
