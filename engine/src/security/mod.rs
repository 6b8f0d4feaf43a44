//! Security validator
//!
//! Four-stage package validation pipeline.
//!
//! Every package passes through, in order:
//! 1. **Signature**: embedded signature verified by the [`SignatureService`]
//! 2. **Trusted source**: origin URL checked against allow/deny lists
//! 3. **Malware scan**: static heuristics over the package sources
//! 4. **Policy decision**: the configured [`SecurityPolicy`] combines the above
//!
//! Each stage records its own [`StepResult`]. A stage that fails internally
//! degrades to a warning-level issue instead of aborting the pipeline; the one
//! exception is an unparseable signature under the enterprise policy.

pub mod scanner;
pub mod source;

use crate::config::{SecurityConfig, SecurityPolicy};
use crate::package::PluginPackage;
use crate::signature::{SignatureService, SignatureVerification};
use chrono::{DateTime, Utc};
use scanner::MalwareScanner;
use sdk::errors::EngineError;
use sdk::types::{SecurityIssue, SecurityLevel, Severity, ThreatType};
use serde::Serialize;
use source::{SourcePolicy, SourceVerdict};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Pipeline stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStep {
    Signature,
    TrustedSource,
    MalwareScan,
    PolicyDecision,
}

/// Outcome of one pipeline stage
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: ValidationStep,
    pub passed: bool,
    pub skipped: bool,
    pub detail: String,
}

impl StepResult {
    fn passed(step: ValidationStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            passed: true,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn failed(step: ValidationStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            passed: false,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn skipped(step: ValidationStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            passed: false,
            skipped: true,
            detail: detail.into(),
        }
    }
}

/// Full result of validating one package
#[derive(Debug, Clone, Serialize)]
pub struct SecurityValidationResult {
    pub plugin_id: String,
    pub policy: SecurityPolicy,
    pub level: SecurityLevel,
    /// Policy verdict
    pub allowed: bool,
    pub steps: Vec<StepResult>,
    pub issues: Vec<SecurityIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureVerification>,
    pub validated_at: DateTime<Utc>,
}

impl SecurityValidationResult {
    pub fn step(&self, step: ValidationStep) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    /// Convert a denied verdict into `EngineError::SecurityBlocked`
    pub fn ensure_allowed(&self) -> Result<(), EngineError> {
        if self.allowed {
            Ok(())
        } else {
            Err(EngineError::SecurityBlocked {
                level: self.level,
                issues: self.issues.clone(),
            })
        }
    }
}

/// Orchestrates signature, source, scan and policy checks
pub struct SecurityValidator {
    config: SecurityConfig,
    signatures: Arc<SignatureService>,
    sources: SourcePolicy,
    scanner: MalwareScanner,
    history: Mutex<VecDeque<SecurityValidationResult>>,
}

impl SecurityValidator {
    pub fn new(config: SecurityConfig, signatures: Arc<SignatureService>) -> Result<Self, EngineError> {
        let scanner = MalwareScanner::new(config.long_line_threshold, config.obfuscation_ratio)?;
        let sources = SourcePolicy::new(&config.trusted_sources, &config.blocked_sources);

        tracing::info!(policy = ?config.policy, "SecurityValidator initialized");

        Ok(Self {
            config,
            signatures,
            sources,
            scanner,
            history: Mutex::new(VecDeque::new()),
        })
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.config.policy
    }

    pub fn signatures(&self) -> &Arc<SignatureService> {
        &self.signatures
    }

    /// Validate raw package bytes under the configured policy
    pub fn validate(
        &self,
        bytes: &[u8],
        source_url: Option<&str>,
    ) -> Result<SecurityValidationResult, EngineError> {
        self.validate_with_policy(bytes, source_url, self.config.policy)
    }

    /// Validate raw package bytes under an explicit policy
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ManifestParse` if the bytes are not a package, and
    /// `EngineError::SignatureInvalid` if the signature block cannot be parsed
    /// under the enterprise policy. Every other failure is reported in the
    /// returned result.
    pub fn validate_with_policy(
        &self,
        bytes: &[u8],
        source_url: Option<&str>,
        policy: SecurityPolicy,
    ) -> Result<SecurityValidationResult, EngineError> {
        let package = PluginPackage::parse(bytes)?;
        let plugin_id = package.manifest.id.clone();
        let mut issues = Vec::new();
        let mut steps = Vec::with_capacity(4);

        tracing::info!(plugin_id = %plugin_id, policy = ?policy, "Validating package");

        // Stage 1: signature
        let (signature_step, signature) = self.check_signature(&package, policy, &mut issues)?;
        steps.push(signature_step);

        // Stage 2: trusted source
        let (source_step, blocked_source) = self.check_source(source_url, policy, &mut issues);
        steps.push(source_step);

        // Stage 3: malware scan
        let scan_step = if blocked_source {
            StepResult::skipped(ValidationStep::MalwareScan, "source is blocked")
        } else {
            self.check_malware(&package, bytes.len() as u64, &mut issues)
        };
        steps.push(scan_step);

        // Stage 4: policy decision
        let max_severity = issues.iter().map(|i| i.severity).max();
        let malware_max = issues
            .iter()
            .filter(|i| is_scan_threat(i.threat_type))
            .map(|i| i.severity)
            .max();
        let passed = |step: ValidationStep| steps.iter().any(|s| s.step == step && s.passed);

        let mut allowed = match policy {
            SecurityPolicy::Enterprise => {
                passed(ValidationStep::Signature)
                    && passed(ValidationStep::TrustedSource)
                    && passed(ValidationStep::MalwareScan)
            }
            SecurityPolicy::Standard => {
                (passed(ValidationStep::Signature) || passed(ValidationStep::TrustedSource))
                    && malware_max.map_or(true, |s| s < Severity::High)
            }
            SecurityPolicy::Relaxed => malware_max.map_or(true, |s| s < Severity::Critical),
        };
        if max_severity == Some(Severity::Critical) {
            allowed = false;
        }

        let mut level = SecurityLevel::from_severity(max_severity);
        if !allowed && level < SecurityLevel::Dangerous {
            level = SecurityLevel::Dangerous;
        }

        let decision_detail = format!("policy {:?} {}", policy, if allowed { "allows" } else { "denies" });
        steps.push(if allowed {
            StepResult::passed(ValidationStep::PolicyDecision, decision_detail)
        } else {
            StepResult::failed(ValidationStep::PolicyDecision, decision_detail)
        });

        let result = SecurityValidationResult {
            plugin_id,
            policy,
            level,
            allowed,
            steps,
            issues,
            signature,
            validated_at: Utc::now(),
        };

        if result.allowed {
            tracing::info!(plugin_id = %result.plugin_id, level = %result.level, "Package allowed");
        } else {
            tracing::warn!(
                plugin_id = %result.plugin_id,
                level = %result.level,
                issues = result.issues.len(),
                "Package denied by security policy"
            );
        }

        self.record(result.clone());
        Ok(result)
    }

    fn check_signature(
        &self,
        package: &PluginPackage,
        policy: SecurityPolicy,
        issues: &mut Vec<SecurityIssue>,
    ) -> Result<(StepResult, Option<SignatureVerification>), EngineError> {
        let step = ValidationStep::Signature;

        let verified = package.signature_info().and_then(|info| match info {
            None => Ok(None),
            Some(info) => {
                let payload = package.signed_payload()?;
                self.signatures.verify(&payload, &info, Utc::now()).map(Some)
            }
        });

        match verified {
            Ok(None) => {
                issues.push(
                    SecurityIssue::new(ThreatType::UnsignedPackage, Severity::Medium, 1.0, "package is not signed")
                        .with_suggestion("Sign the package with a certificate from a trusted root"),
                );
                Ok((StepResult::failed(step, "unsigned"), None))
            }
            Ok(Some(verification)) if verification.is_trusted() => {
                Ok((StepResult::passed(step, "signature trusted"), Some(verification)))
            }
            Ok(Some(verification)) => {
                let failures = verification.failures().join(", ");
                issues.push(
                    SecurityIssue::new(
                        ThreatType::InvalidSignature,
                        Severity::High,
                        1.0,
                        format!("signature not trusted: {}", failures),
                    )
                    .with_suggestion("Re-sign the package with a valid, unrevoked certificate"),
                );
                Ok((StepResult::failed(step, failures), Some(verification)))
            }
            Err(e) if policy == SecurityPolicy::Enterprise => {
                tracing::error!(plugin_id = %package.manifest.id, "Signature parse failed: {}", e);
                Err(e)
            }
            Err(e) => {
                tracing::warn!(plugin_id = %package.manifest.id, "Signature stage error: {}", e);
                issues.push(SecurityIssue::new(
                    ThreatType::InvalidSignature,
                    Severity::Medium,
                    0.5,
                    format!("signature could not be parsed: {}", e),
                ));
                Ok((StepResult::failed(step, e.to_string()), None))
            }
        }
    }

    /// Returns the step and whether the source is on the deny-list
    fn check_source(
        &self,
        source_url: Option<&str>,
        policy: SecurityPolicy,
        issues: &mut Vec<SecurityIssue>,
    ) -> (StepResult, bool) {
        let step = ValidationStep::TrustedSource;
        let verdict = match source_url {
            None => Ok(SourceVerdict::Unknown),
            Some(url) => self.sources.classify(url),
        };

        match verdict {
            Ok(SourceVerdict::Trusted) => (StepResult::passed(step, "trusted source"), false),
            Ok(SourceVerdict::Blocked) => {
                issues.push(SecurityIssue::new(
                    ThreatType::BlockedSource,
                    Severity::Critical,
                    1.0,
                    format!("source {} is blocked", source_url.unwrap_or_default()),
                ));
                (StepResult::failed(step, "blocked source"), true)
            }
            Ok(SourceVerdict::Unknown) if policy == SecurityPolicy::Relaxed => {
                (StepResult::passed(step, "unlisted source accepted by relaxed policy"), false)
            }
            Ok(SourceVerdict::Unknown) => {
                issues.push(
                    SecurityIssue::new(
                        ThreatType::UntrustedSource,
                        Severity::Low,
                        1.0,
                        format!("source {} is not trusted", source_url.unwrap_or("(local)")),
                    )
                    .with_suggestion("Install from a trusted source"),
                );
                (StepResult::failed(step, "untrusted source"), false)
            }
            Err(e) => {
                tracing::warn!("Source check error: {}", e);
                issues.push(SecurityIssue::new(ThreatType::ScanError, Severity::Low, 0.5, e.to_string()));
                (StepResult::failed(step, e.to_string()), false)
            }
        }
    }

    fn check_malware(
        &self,
        package: &PluginPackage,
        size: u64,
        issues: &mut Vec<SecurityIssue>,
    ) -> StepResult {
        let mut found = self.scanner.scan(&package.files);

        if size > self.config.max_package_size {
            found.push(
                SecurityIssue::new(
                    ThreatType::OversizedPackage,
                    Severity::Medium,
                    0.7,
                    format!(
                        "package is {} bytes, above the {} byte limit",
                        size, self.config.max_package_size
                    ),
                )
                .with_suggestion("Split large assets out of the package"),
            );
        }

        let worst = found.iter().map(|i| i.severity).max();
        let detail = format!("{} finding(s)", found.len());
        issues.extend(found);

        match worst {
            None | Some(Severity::Low) => StepResult::passed(ValidationStep::MalwareScan, detail),
            _ => StepResult::failed(ValidationStep::MalwareScan, detail),
        }
    }

    fn record(&self, result: SecurityValidationResult) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Recent validation results, oldest first
    pub fn history(&self) -> Vec<SecurityValidationResult> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

fn is_scan_threat(threat: ThreatType) -> bool {
    matches!(
        threat,
        ThreatType::RestrictedImport
            | ThreatType::DangerousCall
            | ThreatType::SuspiciousPattern
            | ThreatType::Obfuscation
            | ThreatType::OversizedPackage
    )
}
