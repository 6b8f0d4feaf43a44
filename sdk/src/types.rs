//! Shared lifecycle, security, and dependency types
//!
//! These types cross the engine/plugin boundary and appear inside
//! [`EngineError`](crate::errors::EngineError) variants, so they live in the SDK.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a plugin instance
///
/// Valid transitions:
///
/// ```text
/// unloaded -> loaded -> initialized -> started <-> paused
/// started | paused -> stopped -> unloaded
/// loaded | initialized -> unloaded
/// any -> error
/// error -> loaded (fresh load only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loaded,
    Initialized,
    Started,
    Paused,
    Stopped,
    Error,
}

impl PluginState {
    /// Whether moving from `self` to `next` is a legal lifecycle transition
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;

        if next == Error {
            return true;
        }

        matches!(
            (self, next),
            (Unloaded, Loaded)
                | (Error, Loaded)
                | (Loaded, Initialized)
                | (Initialized, Started)
                | (Started, Paused)
                | (Paused, Started)
                | (Started, Stopped)
                | (Paused, Stopped)
                | (Stopped, Unloaded)
                | (Loaded, Unloaded)
                | (Initialized, Unloaded)
                | (Error, Unloaded)
        )
    }

    /// States in which a plugin counts as a live dependency of others
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PluginState::Initialized | PluginState::Started | PluginState::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::Started => "started",
            PluginState::Paused => "paused",
            PluginState::Stopped => "stopped",
            PluginState::Error => "error",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered plugin instance as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstance {
    pub id: String,
    pub version: String,
    pub state: PluginState,
    pub granted_permissions: Vec<String>,
    /// Package size in bytes
    pub size: u64,
    pub installed_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl PluginInstance {
    pub fn new(id: impl Into<String>, version: impl Into<String>, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version: version.into(),
            state: PluginState::Unloaded,
            granted_permissions: Vec::new(),
            size,
            installed_at: now,
            last_used_at: now,
        }
    }
}

/// Severity of a single security finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Overall verdict level of a validated package
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Safe,
    Warning,
    Dangerous,
    Blocked,
}

impl SecurityLevel {
    /// Map the highest observed severity to a level
    pub fn from_severity(severity: Option<Severity>) -> Self {
        match severity {
            None => SecurityLevel::Safe,
            Some(Severity::Low) | Some(Severity::Medium) => SecurityLevel::Warning,
            Some(Severity::High) => SecurityLevel::Dangerous,
            Some(Severity::Critical) => SecurityLevel::Blocked,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityLevel::Safe => "safe",
            SecurityLevel::Warning => "warning",
            SecurityLevel::Dangerous => "dangerous",
            SecurityLevel::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Category of a security finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    UnsignedPackage,
    InvalidSignature,
    UntrustedSource,
    BlockedSource,
    RestrictedImport,
    DangerousCall,
    SuspiciousPattern,
    Obfuscation,
    OversizedPackage,
    PolicyViolation,
    ScanError,
}

/// A single finding produced by the security pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub threat_type: ThreatType,
    pub severity: Severity,
    /// Detector confidence in `0.0..=1.0`
    pub confidence: f32,
    pub message: String,
    /// Package-relative file the finding came from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl SecurityIssue {
    pub fn new(
        threat_type: ThreatType,
        severity: Severity,
        confidence: f32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            threat_type,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            message: message.into(),
            file: None,
            suggestions: Vec::new(),
        }
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// A required dependency that is neither installed nor available
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingDependency {
    /// Plugin declaring the dependency
    pub requester: String,
    pub dependency_id: String,
    pub constraint: String,
}

/// One version-constraint request against a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintRequest {
    pub requester: String,
    pub constraint: String,
}

/// A dependency whose resolved version violates one or more requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConflict {
    pub dependency_id: String,
    /// Version the constraints were checked against
    pub resolved_version: String,
    /// Only the requests that reject `resolved_version`
    pub conflicting: Vec<ConstraintRequest>,
}

impl VersionConflict {
    pub fn requesters(&self) -> Vec<&str> {
        self.conflicting.iter().map(|r| r.requester.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use PluginState::*;
        let path = [Unloaded, Loaded, Initialized, Started, Stopped, Unloaded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        use PluginState::*;
        assert!(!Loaded.can_transition_to(Started));
        assert!(!Unloaded.can_transition_to(Started));
        assert!(!Initialized.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Started));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Error.can_transition_to(Started));
    }

    #[test]
    fn test_error_reachable_from_everywhere() {
        use PluginState::*;
        for state in [Unloaded, Loaded, Initialized, Started, Paused, Stopped, Error] {
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(SecurityLevel::from_severity(None), SecurityLevel::Safe);
        assert_eq!(
            SecurityLevel::from_severity(Some(Severity::Low)),
            SecurityLevel::Warning
        );
        assert_eq!(
            SecurityLevel::from_severity(Some(Severity::High)),
            SecurityLevel::Dangerous
        );
        assert_eq!(
            SecurityLevel::from_severity(Some(Severity::Critical)),
            SecurityLevel::Blocked
        );
    }

    #[test]
    fn test_issue_confidence_is_clamped() {
        let issue = SecurityIssue::new(ThreatType::ScanError, Severity::Low, 3.0, "x");
        assert_eq!(issue.confidence, 1.0);
    }
}
