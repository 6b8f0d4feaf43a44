//! Signature service
//!
//! Detached ed25519 signatures over plugin packages.
//!
//! This module signs and verifies package payloads:
//! - Packages are signed with a publisher key whose [`Certificate`] is issued
//!   (signed) by one of the configured trusted root keys
//! - A certificate carries a validity window and a serial that can be revoked
//! - An optional [`Timestamp`] from a trusted authority pins the signing time;
//!   when it verifies, the certificate window is checked against it instead of
//!   the current time
//!
//! # Security
//!
//! A signature is trusted only when the algorithm is supported, the
//! certificate chains to a trusted root, lies inside its validity window, is
//! not revoked, the payload signature verifies, and any timestamp present
//! verifies independently.

pub mod digest;

use crate::config::SecurityConfig;
use crate::package::PluginPackage;
use chrono::{DateTime, Utc};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::RwLock;

/// The only algorithm this service can verify
pub const ED25519: &str = "ed25519";

/// Publisher certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub serial: String,
    pub subject: String,
    /// Hex-encoded public key of the issuing root
    pub issuer_key: String,
    /// Hex-encoded publisher public key
    pub public_key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Hex-encoded issuer signature over the fields above
    pub issuer_signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateBody<'a> {
    serial: &'a str,
    subject: &'a str,
    issuer_key: &'a str,
    public_key: &'a str,
    not_before: &'a DateTime<Utc>,
    not_after: &'a DateTime<Utc>,
}

impl Certificate {
    /// Issue a certificate for `publisher` signed by `issuer`
    pub fn issue(
        issuer: &SigningKey,
        publisher: &VerifyingKey,
        serial: impl Into<String>,
        subject: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let mut cert = Self {
            serial: serial.into(),
            subject: subject.into(),
            issuer_key: hex::encode(issuer.verifying_key().as_bytes()),
            public_key: hex::encode(publisher.as_bytes()),
            not_before,
            not_after,
            issuer_signature: String::new(),
        };
        let body = cert.to_be_signed()?;
        cert.issuer_signature = hex::encode(issuer.sign(&body).to_bytes());
        Ok(cert)
    }

    fn to_be_signed(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(&CertificateBody {
            serial: &self.serial,
            subject: &self.subject,
            issuer_key: &self.issuer_key,
            public_key: &self.public_key,
            not_before: &self.not_before,
            not_after: &self.not_after,
        })
        .map_err(|e| EngineError::SignatureInvalid(format!("Failed to encode certificate: {}", e)))
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// Countersignature from a timestamp authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub time: DateTime<Utc>,
    /// Hex-encoded authority public key
    pub authority_key: String,
    /// Hex-encoded authority signature over `sha256(signature) || time`
    pub token: String,
}

impl Timestamp {
    /// Countersign `signature_bytes` at `time`
    pub fn issue(authority: &SigningKey, signature_bytes: &[u8], time: DateTime<Utc>) -> Self {
        let message = timestamp_message(signature_bytes, &time);
        Self {
            time,
            authority_key: hex::encode(authority.verifying_key().as_bytes()),
            token: hex::encode(authority.sign(&message).to_bytes()),
        }
    }
}

fn timestamp_message(signature_bytes: &[u8], time: &DateTime<Utc>) -> Vec<u8> {
    let mut message = digest::sha256(signature_bytes).to_vec();
    message.extend_from_slice(time.to_rfc3339().as_bytes());
    message
}

/// Detached signature embedded in a package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub algorithm: String,
    /// Hex-encoded signature over `sha256(payload)`
    pub signature_bytes: String,
    pub certificate: Certificate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// Outcome of verifying one signature
///
/// Each check is recorded independently so callers can report exactly which
/// condition failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureVerification {
    pub algorithm_supported: bool,
    pub certificate_trusted: bool,
    pub certificate_in_window: bool,
    pub certificate_revoked: bool,
    pub signature_valid: bool,
    /// `None` when the signature carries no timestamp
    pub timestamp_valid: Option<bool>,
}

impl SignatureVerification {
    fn unsupported() -> Self {
        Self {
            algorithm_supported: false,
            certificate_trusted: false,
            certificate_in_window: false,
            certificate_revoked: false,
            signature_valid: false,
            timestamp_valid: None,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.algorithm_supported
            && self.certificate_trusted
            && self.certificate_in_window
            && !self.certificate_revoked
            && self.signature_valid
            && self.timestamp_valid.unwrap_or(true)
    }

    /// Human-readable list of failed checks
    pub fn failures(&self) -> Vec<&'static str> {
        let mut failures = Vec::new();
        if !self.algorithm_supported {
            failures.push("unsupported signature algorithm");
            return failures;
        }
        if !self.certificate_trusted {
            failures.push("certificate not issued by a trusted root");
        }
        if !self.certificate_in_window {
            failures.push("certificate outside its validity window");
        }
        if self.certificate_revoked {
            failures.push("certificate revoked");
        }
        if !self.signature_valid {
            failures.push("signature does not match package contents");
        }
        if self.timestamp_valid == Some(false) {
            failures.push("timestamp could not be verified");
        }
        failures
    }
}

/// Signature generation and verification service
///
/// # Examples
///
/// ```no_run
/// use plexus_engine::config::SecurityConfig;
/// use plexus_engine::signature::SignatureService;
///
/// let service = SignatureService::new(&SecurityConfig::default()).unwrap();
/// service.revoke("serial-0042");
/// ```
pub struct SignatureService {
    trusted_roots: Vec<VerifyingKey>,
    timestamp_authorities: Vec<VerifyingKey>,
    supported_algorithms: Vec<String>,
    revoked: RwLock<HashSet<String>>,
}

impl SignatureService {
    /// Build the service from the security configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if any configured key is malformed.
    pub fn new(config: &SecurityConfig) -> Result<Self, EngineError> {
        let parse_all = |keys: &[String]| -> Result<Vec<VerifyingKey>, EngineError> {
            keys.iter()
                .map(|k| parse_public_key(k).map_err(|e| EngineError::Config(e.to_string())))
                .collect()
        };

        let service = Self {
            trusted_roots: parse_all(&config.trusted_root_keys)?,
            timestamp_authorities: parse_all(&config.timestamp_authority_keys)?,
            supported_algorithms: config.supported_algorithms.clone(),
            revoked: RwLock::new(config.revoked_certificates.iter().cloned().collect()),
        };

        tracing::info!(
            roots = service.trusted_roots.len(),
            authorities = service.timestamp_authorities.len(),
            "SignatureService initialized"
        );
        Ok(service)
    }

    /// Build the service from keys directly
    pub fn with_keys(trusted_roots: Vec<VerifyingKey>, timestamp_authorities: Vec<VerifyingKey>) -> Self {
        Self {
            trusted_roots,
            timestamp_authorities,
            supported_algorithms: vec![ED25519.to_string()],
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Mark a certificate serial as revoked
    pub fn revoke(&self, serial: impl Into<String>) {
        let serial = serial.into();
        tracing::warn!(serial = %serial, "Certificate revoked");
        self.revoked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(serial);
    }

    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(serial)
    }

    /// Sign `payload` and return a detached signature
    pub fn sign(
        payload: &[u8],
        publisher: &SigningKey,
        certificate: Certificate,
        timestamp_authority: Option<&SigningKey>,
    ) -> SignatureInfo {
        let signature = publisher.sign(&digest::sha256(payload));
        let signature_bytes = signature.to_bytes();
        let timestamp =
            timestamp_authority.map(|tsa| Timestamp::issue(tsa, &signature_bytes, Utc::now()));

        SignatureInfo {
            algorithm: ED25519.to_string(),
            signature_bytes: hex::encode(signature_bytes),
            certificate,
            timestamp,
        }
    }

    /// Sign a package and embed the signature into it
    pub fn sign_package(
        package: &mut PluginPackage,
        publisher: &SigningKey,
        certificate: Certificate,
        timestamp_authority: Option<&SigningKey>,
    ) -> Result<SignatureInfo, EngineError> {
        let payload = package.signed_payload()?;
        let info = Self::sign(&payload, publisher, certificate, timestamp_authority);
        package.embed_signature(&info)?;
        tracing::info!(plugin_id = %package.manifest.id, "Package signed");
        Ok(info)
    }

    /// Verify a detached signature over `payload`
    ///
    /// Verification failures are reported in the returned
    /// [`SignatureVerification`]; only malformed input is an error.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::SignatureInvalid` if the signature, keys or
    /// certificate cannot be decoded.
    pub fn verify(
        &self,
        payload: &[u8],
        info: &SignatureInfo,
        now: DateTime<Utc>,
    ) -> Result<SignatureVerification, EngineError> {
        tracing::debug!(algorithm = %info.algorithm, serial = %info.certificate.serial, "Verifying signature");

        if info.algorithm != ED25519
            || !self.supported_algorithms.iter().any(|a| a == &info.algorithm)
        {
            tracing::warn!(algorithm = %info.algorithm, "Unsupported signature algorithm");
            return Ok(SignatureVerification::unsupported());
        }

        let cert = &info.certificate;
        let publisher_key = parse_public_key(&cert.public_key)?;
        let issuer_key = parse_public_key(&cert.issuer_key)?;
        let issuer_signature = parse_signature(&cert.issuer_signature)?;
        let signature = parse_signature(&info.signature_bytes)?;

        let certificate_trusted = self.trusted_roots.contains(&issuer_key)
            && issuer_key
                .verify(&cert.to_be_signed()?, &issuer_signature)
                .is_ok();

        let timestamp_valid = match &info.timestamp {
            None => None,
            Some(ts) => Some(self.verify_timestamp(ts, &signature, cert)?),
        };

        let reference_time = match (&info.timestamp, timestamp_valid) {
            (Some(ts), Some(true)) => ts.time,
            _ => now,
        };

        let verification = SignatureVerification {
            algorithm_supported: true,
            certificate_trusted,
            certificate_in_window: cert.covers(reference_time),
            certificate_revoked: self.is_revoked(&cert.serial),
            signature_valid: publisher_key
                .verify(&digest::sha256(payload), &signature)
                .is_ok(),
            timestamp_valid,
        };

        if verification.is_trusted() {
            tracing::info!(serial = %cert.serial, subject = %cert.subject, "Signature verified");
        } else {
            tracing::warn!(
                serial = %cert.serial,
                failures = ?verification.failures(),
                "Signature not trusted"
            );
        }

        Ok(verification)
    }

    fn verify_timestamp(
        &self,
        ts: &Timestamp,
        signature: &Signature,
        cert: &Certificate,
    ) -> Result<bool, EngineError> {
        let authority = parse_public_key(&ts.authority_key)?;
        let token = parse_signature(&ts.token)?;

        if !self.timestamp_authorities.contains(&authority) {
            tracing::warn!("Timestamp authority is not trusted");
            return Ok(false);
        }

        let message = timestamp_message(&signature.to_bytes(), &ts.time);
        let valid = authority.verify(&message, &token).is_ok() && cert.covers(ts.time);
        Ok(valid)
    }
}

/// Parse a hex-encoded ed25519 public key
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey, EngineError> {
    let bytes = hex::decode(hex_key.strip_prefix("ed25519:").unwrap_or(hex_key))
        .map_err(|e| EngineError::SignatureInvalid(format!("Invalid key hex: {}", e)))?;

    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        EngineError::SignatureInvalid(format!(
            "Invalid key length: expected {}, got {}",
            PUBLIC_KEY_LENGTH,
            b.len()
        ))
    })?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| EngineError::SignatureInvalid(format!("Invalid public key: {}", e)))
}

/// Parse a hex-encoded ed25519 private key seed
pub fn parse_signing_key(hex_seed: &str) -> Result<SigningKey, EngineError> {
    let bytes = hex::decode(hex_seed)
        .map_err(|e| EngineError::Config(format!("Invalid key hex: {}", e)))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EngineError::Config("Signing key must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Parse a signature string in format "ed25519:hex_string" or plain hex
fn parse_signature(sig_str: &str) -> Result<Signature, EngineError> {
    let hex = sig_str.strip_prefix("ed25519:").unwrap_or(sig_str);

    let bytes = hex::decode(hex).map_err(|e| {
        tracing::error!("Failed to decode signature hex: {}", e);
        EngineError::SignatureInvalid(format!("Invalid signature hex: {}", e))
    })?;

    let sig_bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
        EngineError::SignatureInvalid(format!(
            "Invalid signature length: expected {}, got {}",
            SIGNATURE_LENGTH,
            b.len()
        ))
    })?;

    Ok(Signature::from_bytes(&sig_bytes))
}
