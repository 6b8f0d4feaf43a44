//! Error types and handling
//!
//! This module provides the error type used throughout the Plexus runtime.
//! Every variant carries the structured data a caller needs for diagnostics
//! (missing dependencies, conflicts, cycles, security issues) rather than an
//! opaque code. All errors implement [`PlexusErrorExt`], which adds a
//! user-facing hint and a recoverability flag.
//!
//! `EngineError` is `Clone` so that several callers awaiting the same
//! in-flight operation can each receive the failure.

use crate::types::{MissingDependency, PluginState, SecurityIssue, SecurityLevel, VersionConflict};
use thiserror::Error;

/// Trait for Plexus error extensions
pub trait PlexusErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and never contains file
    /// paths, key material or other internal details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Non-recoverable errors (malformed manifests, signature and checksum
    /// failures, security blocks) must never be bypassed by retrying.
    fn is_recoverable(&self) -> bool;
}

/// Main runtime error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, PlexusErrorExt};
///
/// let error = EngineError::NotFound("demo_plugin".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::SignatureInvalid("bad certificate".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    // Manifest errors
    #[error("Structural validation failed for '{plugin_id}': {}", problems.join("; "))]
    StructuralValidation {
        plugin_id: String,
        problems: Vec<String>,
    },

    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    // Dependency errors
    #[error("Plugin '{plugin_id}' has {} missing dependencies", missing.len())]
    DependencyMissing {
        plugin_id: String,
        missing: Vec<MissingDependency>,
    },

    #[error("{} dependency version conflicts", conflicts.len())]
    DependencyConflict { conflicts: Vec<VersionConflict> },

    #[error("{} dependency cycles detected", cycles.len())]
    DependencyCycle { cycles: Vec<Vec<String>> },

    #[error("Dependency ordering incomplete: {ordered}/{total} plugins ordered")]
    DependencyOrderIncomplete { ordered: usize, total: usize },

    // Lifecycle errors
    #[error("Cannot {action} plugin '{plugin_id}' in state {state}")]
    LifecycleState {
        plugin_id: String,
        state: PluginState,
        action: String,
    },

    #[error("Plugin '{plugin_id}' is required by active plugins: {}", dependents.join(", "))]
    DependentsActive {
        plugin_id: String,
        dependents: Vec<String>,
    },

    #[error("Loading plugin '{plugin_id}' timed out after {timeout_ms} ms")]
    LoadTimeout { plugin_id: String, timeout_ms: u64 },

    #[error("Plugin '{plugin_id}' failed during {stage}: {message}")]
    PluginFailure {
        plugin_id: String,
        stage: String,
        message: String,
    },

    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error("A reload is already in progress")]
    ReloadInProgress,

    // Security errors
    #[error("Package blocked by security policy (level {level}, {} issues)", issues.len())]
    SecurityBlocked {
        level: SecurityLevel,
        issues: Vec<SecurityIssue>,
    },

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Download errors
    #[error("Download '{task_id}' failed after {retries} retries: {reason}")]
    DownloadFailed {
        task_id: String,
        retries: u32,
        reason: String,
    },

    #[error("Concurrent download limit of {limit} reached")]
    DownloadLimitReached { limit: usize },

    #[error("Download cancelled: {0}")]
    DownloadCancelled(String),

    #[error("Download already active: {0}")]
    DuplicateDownload(String),

    // Messaging errors
    #[error("Message {message_id} to '{target}' timed out after {timeout_ms} ms")]
    MessageTimeout {
        message_id: String,
        target: String,
        timeout_ms: u64,
    },

    #[error("Target plugin '{plugin_id}' is not active (state {state})")]
    TargetNotActive {
        plugin_id: String,
        state: PluginState,
    },

    // Generic errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::ManifestParse(e.to_string())
    }
}

impl EngineError {
    /// Shorthand for a [`EngineError::LifecycleState`] error
    pub fn lifecycle(plugin_id: &str, state: PluginState, action: &str) -> Self {
        EngineError::LifecycleState {
            plugin_id: plugin_id.to_string(),
            state,
            action: action.to_string(),
        }
    }

    /// Shorthand for a [`EngineError::PluginFailure`] error
    pub fn plugin_failure(plugin_id: &str, stage: &str, message: impl ToString) -> Self {
        EngineError::PluginFailure {
            plugin_id: plugin_id.to_string(),
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }
}

impl PlexusErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Manifest errors
            Self::StructuralValidation { .. } => "The plugin manifest is invalid. Contact the plugin author",
            Self::ManifestParse(_) => "The plugin manifest could not be read",

            // Dependency errors
            Self::DependencyMissing { .. } => "Install the missing dependencies first",
            Self::DependencyConflict { .. } => "Installed plugin versions do not satisfy this plugin",
            Self::DependencyCycle { .. } => "Plugins depend on each other in a loop",
            Self::DependencyOrderIncomplete { .. } => "Dependency order could not be computed",

            // Lifecycle errors
            Self::LifecycleState { .. } => "This action is not allowed in the plugin's current state",
            Self::DependentsActive { .. } => "Stop the plugins that depend on this one first",
            Self::LoadTimeout { .. } => "The plugin took too long to start. Try again",
            Self::PluginFailure { .. } => "The plugin reported an error. Check plugin logs",
            Self::AlreadyRegistered(_) => "The plugin is already loaded",
            Self::ReloadInProgress => "Another reload is running. Try again shortly",

            // Security errors
            Self::SecurityBlocked { .. } => "The package was blocked by the security policy",
            Self::SignatureInvalid(_) => "Security verification failed. Package may be tampered",
            Self::ChecksumMismatch { .. } => "Security verification failed. File may be corrupted",

            // Download errors
            Self::DownloadFailed { .. } => "Download failed. Check your connection",
            Self::DownloadLimitReached { .. } => "Too many downloads running. Wait for one to finish",
            Self::DownloadCancelled(_) => "The download was cancelled",
            Self::DuplicateDownload(_) => "This download is already running",

            // Messaging errors
            Self::MessageTimeout { .. } => "The plugin did not answer in time",
            Self::TargetNotActive { .. } => "The target plugin is not running",

            // Generic errors
            Self::NotFound(_) => "The requested plugin or resource does not exist",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Network(_) => "Network operation failed. Check your connection",
            Self::Storage(_) => "Plugin storage operation failed",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::StructuralValidation { .. }
            | Self::ManifestParse(_)
            | Self::DependencyCycle { .. }
            | Self::SecurityBlocked { .. }
            | Self::SignatureInvalid(_)
            | Self::ChecksumMismatch { .. } => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
